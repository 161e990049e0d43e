//! # Correlation Tracking
//!
//! Every forward-auth request gets one opaque correlation id before any other stage
//! runs. The id is stored in the request's extensions, appears on every log line for
//! the request, and is returned to the proxy in the `X-Correlation-Id` header and in
//! every error body.
//!
//! A missing id is logged but never blocks the request; callers fall back to
//! [`CorrelationId::unknown`].

use axum::{extract::Request, http::HeaderName, middleware::Next, response::Response};
use std::fmt;
use uuid::Uuid;

/// Response header carrying the correlation id
pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

const UNKNOWN: &str = "unknown";

/// Opaque per-request identifier used for tracing and log correlation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new id: 128 random bits rendered as 32 hex characters, no separators
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Placeholder used when a request somehow reached a stage without an id
    pub fn unknown() -> Self {
        Self(UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues and reads correlation ids in request-scoped state
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationTracker;

impl CorrelationTracker {
    /// Assign a fresh id to the request; an id already present is kept
    pub fn begin(request: &mut Request) -> CorrelationId {
        if let Some(existing) = request.extensions().get::<CorrelationId>() {
            return existing.clone();
        }
        let id = CorrelationId::generate();
        request.extensions_mut().insert(id.clone());
        id
    }

    /// Read the id assigned by [`CorrelationTracker::begin`]
    pub fn get(request: &Request) -> Option<CorrelationId> {
        request.extensions().get::<CorrelationId>().cloned()
    }

    /// Read the id, logging and substituting `unknown` when it is absent
    pub fn get_or_unknown(request: &Request) -> CorrelationId {
        match Self::get(request) {
            Some(id) => id,
            None => {
                tracing::error!("Unable to get correlation ID from request state");
                CorrelationId::unknown()
            }
        }
    }
}

/// Axum middleware that assigns the correlation id before any other stage executes
pub async fn assign_correlation_id(mut request: Request, next: Next) -> Response {
    CorrelationTracker::begin(&mut request);
    next.run(request).await
}
