//! # OIDC Discovery
//!
//! Fetches `{issuer}/.well-known/openid-configuration` and extracts the two fields the
//! gateway needs: the JWKS location and the advertised ID token signing algorithms.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::core::error::{FetchFailure, GatewayError, GatewayResult};

/// Algorithm assumed when the discovery document does not list any
pub const DEFAULT_SIGNING_ALGORITHM: &str = "RS256";

/// The subset of provider metadata used for token validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryDocument {
    pub issuer: Option<String>,
    pub jwks_uri: String,
    pub signing_algorithms: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct RawDiscoveryDocument {
    issuer: Option<String>,
    jwks_uri: Option<String>,
    #[serde(default)]
    id_token_signing_alg_values_supported: Vec<String>,
}

/// Build the discovery URL for an issuer
pub fn discovery_url(issuer_url: &str) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    )
}

/// Parse a discovery document body
pub fn parse_discovery_document(body: &[u8]) -> Result<DiscoveryDocument, String> {
    let raw: RawDiscoveryDocument = serde_json::from_slice(body).map_err(|e| e.to_string())?;

    let jwks_uri = raw
        .jwks_uri
        .filter(|uri| !uri.trim().is_empty())
        .ok_or_else(|| "discovery document has no jwks_uri".to_string())?;

    let mut signing_algorithms: HashSet<String> = raw
        .id_token_signing_alg_values_supported
        .into_iter()
        .filter(|alg| !alg.trim().is_empty())
        .collect();
    if signing_algorithms.is_empty() {
        signing_algorithms.insert(DEFAULT_SIGNING_ALGORITHM.to_string());
    }

    Ok(DiscoveryDocument {
        issuer: raw.issuer,
        jwks_uri,
        signing_algorithms,
    })
}

/// Source of discovery documents
#[async_trait]
pub trait DiscoveryClient: Send + Sync + fmt::Debug {
    async fn discover(&self, issuer_url: &str) -> GatewayResult<DiscoveryDocument>;
}

/// Discovery over HTTP with a bounded timeout
#[derive(Debug, Clone)]
pub struct HttpDiscoveryClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDiscoveryClient {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscoveryClient {
    async fn discover(&self, issuer_url: &str) -> GatewayResult<DiscoveryDocument> {
        let url = discovery_url(issuer_url);
        let timeout_ms = self.timeout.as_millis() as u64;
        debug!(url = %url, "Fetching OIDC discovery document");

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(&url, e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::fetch(
                url,
                FetchFailure::Status {
                    status: status.as_u16(),
                },
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::from_reqwest(&url, e, timeout_ms))?;

        parse_discovery_document(&body)
            .map_err(|message| GatewayError::fetch(url, FetchFailure::Decode { message }))
    }
}
