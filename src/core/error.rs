//! # Error Handling Module
//!
//! This module defines every failure the forward-auth gateway can produce, using the
//! `thiserror` crate, together with the HTTP status each failure maps to when the
//! reverse proxy asks for a decision.
//!
//! ## Error Taxonomy
//!
//! | Category                      | Variants                                                    | Status |
//! |-------------------------------|-------------------------------------------------------------|--------|
//! | Token problems                | `MissingToken`, `MalformedToken`, `UnsupportedAlgorithm`,   | 401    |
//! |                               | `KeyNotFound`, `InvalidSignature`, `Expired`, `NotYetValid` |        |
//! | Valid token, no policy match  | `AuthorizationDenied`                                       | 401    |
//! | No policy for the route       | `PolicyNotFound`                                            | 403    |
//! | Broken or missing setup       | `Configuration`                                             | 403    |
//! | JWKS / OIDC / policy fetches  | `UpstreamFetch`                                             | 403    |
//! | Anything unexpected           | `Internal`                                                  | 403    |
//!
//! Nothing maps to `500`: a forward-auth `5xx` makes some proxies retry, and a retry
//! cannot fix a missing policy or an unreachable identity provider.
//!
//! The `Display` text of an error is for server-side logs only. Responses use
//! [`GatewayError::public_message`], which never includes upstream error text.

use axum::http::StatusCode;
use std::fmt;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Why an outbound fetch (JWKS, OIDC discovery, policy store) failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The remote call did not finish within its bounded timeout
    Timeout { timeout_ms: u64 },
    /// The remote answered with a non-success status
    Status { status: u16 },
    /// Connection, TLS or protocol level failure
    Transport { message: String },
    /// The response body could not be parsed
    Decode { message: String },
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { timeout_ms } => write!(f, "timed out after {}ms", timeout_ms),
            Self::Status { status } => write!(f, "unexpected status {}", status),
            Self::Transport { message } => write!(f, "transport error: {}", message),
            Self::Decode { message } => write!(f, "invalid response body: {}", message),
        }
    }
}

/// Every failure the authorization pipeline can report
///
/// Variants carry owned strings so the error can be cloned into logs and decisions
/// without holding on to the original library error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Missing or invalid setup (bad config, incomplete provider record, unparsable policy)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No policy entry exists for the requested host/path/method
    #[error("Policy not found: {key}")]
    PolicyNotFound { key: String },

    /// The configured token header is absent or empty after prefix stripping
    #[error("No bearer token provided")]
    MissingToken,

    /// The token is not a structurally valid JWT
    #[error("Malformed token: {reason}")]
    MalformedToken { reason: String },

    /// The token header declares no algorithm or one the provider does not allow
    #[error("Unsupported token algorithm: {alg}")]
    UnsupportedAlgorithm { alg: String },

    /// No key in the issuer's key set matches the token's `kid`
    #[error("Signing key not found: {kid}")]
    KeyNotFound { kid: String },

    /// Signature verification (or issuer/audience binding) failed
    #[error("Invalid token signature: {reason}")]
    InvalidSignature { reason: String },

    /// The `exp` claim is in the past
    #[error("Token expired at {expired_at}")]
    Expired { expired_at: i64 },

    /// The `nbf` claim is in the future
    #[error("Token not valid before {not_before}")]
    NotYetValid { not_before: i64 },

    /// The token is valid but neither its roles nor its user match the policy
    #[error("Authorization denied: {reason}")]
    AuthorizationDenied { reason: String },

    /// A remote dependency could not be reached or returned garbage
    #[error("Upstream fetch of {target} failed: {failure}")]
    UpstreamFetch { target: String, failure: FetchFailure },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a malformed-token error with a custom reason
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedToken {
            reason: reason.into(),
        }
    }

    /// Create an authorization-denied error with a custom reason
    pub fn denied<S: Into<String>>(reason: S) -> Self {
        Self::AuthorizationDenied {
            reason: reason.into(),
        }
    }

    /// Create an upstream fetch error for the given target
    pub fn fetch<S: Into<String>>(target: S, failure: FetchFailure) -> Self {
        Self::UpstreamFetch {
            target: target.into(),
            failure,
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map a reqwest failure to a typed fetch failure for `target`
    pub fn from_reqwest(target: &str, err: reqwest::Error, timeout_ms: u64) -> Self {
        let failure = if err.is_timeout() {
            FetchFailure::Timeout { timeout_ms }
        } else if let Some(status) = err.status() {
            FetchFailure::Status {
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            FetchFailure::Decode {
                message: err.to_string(),
            }
        } else {
            FetchFailure::Transport {
                message: err.to_string(),
            }
        };
        Self::fetch(target, failure)
    }

    /// Get the HTTP status code returned to the reverse proxy for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingToken
            | Self::MalformedToken { .. }
            | Self::UnsupportedAlgorithm { .. }
            | Self::KeyNotFound { .. }
            | Self::InvalidSignature { .. }
            | Self::Expired { .. }
            | Self::NotYetValid { .. }
            | Self::AuthorizationDenied { .. } => StatusCode::UNAUTHORIZED,
            Self::Configuration { .. }
            | Self::PolicyNotFound { .. }
            | Self::UpstreamFetch { .. }
            | Self::Internal { .. } => StatusCode::FORBIDDEN,
        }
    }

    /// Whether this error comes from the caller's credentials rather than our infrastructure
    pub fn is_client_error(&self) -> bool {
        self.status_code() == StatusCode::UNAUTHORIZED
    }

    /// Generic text that is safe to put in a response body
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingToken => "Unauthorized: no token provided",
            Self::MalformedToken { .. }
            | Self::UnsupportedAlgorithm { .. }
            | Self::KeyNotFound { .. }
            | Self::InvalidSignature { .. }
            | Self::Expired { .. }
            | Self::NotYetValid { .. } => "Unauthorized: invalid token",
            Self::AuthorizationDenied { .. } => "Unauthorized: access denied",
            Self::Configuration { .. }
            | Self::PolicyNotFound { .. }
            | Self::UpstreamFetch { .. }
            | Self::Internal { .. } => "Error occurred, please contact support",
        }
    }

    /// Get a string representation of the error type for logs and metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::PolicyNotFound { .. } => "policy_not_found",
            Self::MissingToken => "missing_token",
            Self::MalformedToken { .. } => "malformed_token",
            Self::UnsupportedAlgorithm { .. } => "unsupported_algorithm",
            Self::KeyNotFound { .. } => "key_not_found",
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::Expired { .. } => "expired",
            Self::NotYetValid { .. } => "not_yet_valid",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::UpstreamFetch { .. } => "upstream_fetch_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("invalid JSON document: {}", err))
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::config(format!("invalid YAML document: {}", err))
    }
}

/// Implement conversion from kube::Error
impl From<kube::Error> for GatewayError {
    fn from(err: kube::Error) -> Self {
        let failure = match &err {
            kube::Error::Api(response) => FetchFailure::Status {
                status: response.code,
            },
            _ => FetchFailure::Transport {
                message: err.to_string(),
            },
        };
        Self::fetch("kubernetes", failure)
    }
}
