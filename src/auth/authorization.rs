//! # Authorization
//!
//! Decides whether validated claims satisfy a route's [`Policy`], and defines the
//! [`AuthDecision`] the terminal responder turns into the proxy-facing response.
//!
//! A request is allowed when the token's `roles` claim shares at least one role with
//! the policy, or when the local part of `preferred_username` (everything before the
//! first `@`) is one of the policy's users. Both comparisons ignore case.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::auth::correlation::{CorrelationId, CORRELATION_ID_HEADER};
use crate::auth::token::Claims;
use crate::core::error::{GatewayError, GatewayResult};
use crate::policy::store::Policy;

/// Outcome of one forward-auth request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDecision {
    pub allowed: bool,
    pub status: StatusCode,
    /// Public message; never carries internal error text
    pub message: String,
    pub correlation_id: CorrelationId,
}

impl AuthDecision {
    pub fn allow(correlation_id: CorrelationId) -> Self {
        Self {
            allowed: true,
            status: StatusCode::OK,
            message: "OK".to_string(),
            correlation_id,
        }
    }

    pub fn deny(error: &GatewayError, correlation_id: CorrelationId) -> Self {
        Self {
            allowed: false,
            status: error.status_code(),
            message: error.public_message().to_string(),
            correlation_id,
        }
    }

    pub fn outcome(&self) -> &'static str {
        if self.allowed {
            "allowed"
        } else {
            "denied"
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeniedBody<'a> {
    error: &'a str,
    correlation_id: &'a str,
}

impl IntoResponse for AuthDecision {
    fn into_response(self) -> Response {
        let mut response = if self.allowed {
            self.status.into_response()
        } else {
            (
                self.status,
                Json(DeniedBody {
                    error: &self.message,
                    correlation_id: self.correlation_id.as_str(),
                }),
            )
                .into_response()
        };

        if let Ok(value) = HeaderValue::from_str(self.correlation_id.as_str()) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        response
    }
}

/// Policy evaluation strategy
pub trait AuthorizationEngine: Send + Sync + fmt::Debug {
    /// `Ok(())` when `claims` satisfy `policy`, otherwise the reason for denial
    fn authorize(&self, claims: &Claims, policy: &Policy) -> GatewayResult<()>;

    /// Evaluate `policy` and turn the result into the terminal decision
    fn decide(&self, claims: &Claims, policy: &Policy, correlation_id: &CorrelationId) -> AuthDecision {
        match self.authorize(claims, policy) {
            Ok(()) => AuthDecision::allow(correlation_id.clone()),
            Err(err) => {
                warn!(error = %err, error_type = err.error_type(), "Request denied by policy");
                AuthDecision::deny(&err, correlation_id.clone())
            }
        }
    }
}

/// Role-intersection or user-membership authorization
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleUserAuthorizer;

/// Local part of a username, e.g. `alice` for `alice@example.com`
pub fn short_name(username: &str) -> &str {
    username.split('@').next().unwrap_or(username)
}

fn lowercase_set<'a>(values: impl IntoIterator<Item = &'a String>) -> HashSet<String> {
    values.into_iter().map(|v| v.to_lowercase()).collect()
}

impl AuthorizationEngine for RoleUserAuthorizer {
    fn authorize(&self, claims: &Claims, policy: &Policy) -> GatewayResult<()> {
        let token_roles = lowercase_set(&claims.roles());
        let policy_roles = lowercase_set(&policy.roles);
        if !token_roles.is_disjoint(&policy_roles) {
            return Ok(());
        }

        let username = claims.preferred_username().unwrap_or_default();
        let user = short_name(username).to_lowercase();
        if !user.is_empty() && lowercase_set(&policy.users).contains(&user) {
            return Ok(());
        }

        Err(GatewayError::denied(format!(
            "no matching role in {:?} and user '{}' is not permitted",
            claims.roles(),
            user
        )))
    }
}
