//! # Policy Store
//!
//! Resolves `(host, path, method)` to the [`Policy`] that guards it.
//!
//! Each protected host has one record named `access_policy_<host>` (port removed, dots
//! replaced by underscores). Inside it, every entry key is a route slug built by
//! [`policy_key`] and every value is a YAML document:
//!
//! ```yaml
//! roles: [admin, reader]
//! users: [alice]
//! provider_name: azure_prod
//! provider_type: azure
//! ```
//!
//! The key derivation is a fixed contract with whoever writes the records.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::policy::source::ConfigMapSource;

/// Prefix of per-host policy record names
pub const POLICY_RECORD_PREFIX: &str = "access_policy_";

/// Authorization rules for one route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub roles: HashSet<String>,
    pub users: HashSet<String>,
    pub provider_name: String,
    pub provider_type: String,
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    provider_name: String,
    #[serde(default)]
    provider_type: String,
}

impl Policy {
    /// Parse a policy entry value
    pub fn from_yaml(document: &str) -> GatewayResult<Self> {
        let doc: PolicyDocument = serde_yaml::from_str(document)
            .map_err(|e| GatewayError::config(format!("invalid policy document: {}", e)))?;

        if doc.provider_name.trim().is_empty() {
            return Err(GatewayError::config("policy document has no provider_name"));
        }
        if doc.provider_type.trim().is_empty() {
            return Err(GatewayError::config("policy document has no provider_type"));
        }

        Ok(Self {
            roles: doc.roles.into_iter().collect(),
            users: doc.users.into_iter().collect(),
            provider_name: doc.provider_name.trim().to_string(),
            provider_type: doc.provider_type.trim().to_string(),
        })
    }
}

/// Route slug used as the entry key inside a policy record
///
/// `("/api/data", "GET")` and `("API/Data", "get")` both give `api_data_get`.
pub fn policy_key(path: &str, method: &str) -> String {
    let path = path.to_lowercase();
    let path = path.strip_prefix('/').unwrap_or(&path);
    format!("{}_{}", path.replace('/', "_"), method.to_lowercase())
}

/// Name of the policy record for a host
pub fn policy_record_name(host: &str) -> String {
    format!(
        "{}{}",
        POLICY_RECORD_PREFIX,
        strip_port(host.trim()).to_lowercase().replace('.', "_")
    )
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Looks up the policy guarding a route
#[async_trait]
pub trait PolicyStore: Send + Sync + fmt::Debug {
    async fn get_policy(&self, host: &str, path: &str, method: &str) -> GatewayResult<Policy>;
}

/// Policy store reading per-host records from a [`ConfigMapSource`]
#[derive(Debug, Clone)]
pub struct ConfigMapPolicyStore {
    source: Arc<dyn ConfigMapSource>,
}

impl ConfigMapPolicyStore {
    pub fn new(source: Arc<dyn ConfigMapSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl PolicyStore for ConfigMapPolicyStore {
    async fn get_policy(&self, host: &str, path: &str, method: &str) -> GatewayResult<Policy> {
        let record = policy_record_name(host);
        let key = policy_key(path, method);
        debug!(record = %record, key = %key, "Loading access policy");

        let not_found = || GatewayError::PolicyNotFound {
            key: format!("{}/{}", record, key),
        };

        let data = self.source.get(&record).await?.ok_or_else(not_found)?;
        let document = data.get(&key).ok_or_else(not_found)?;
        Policy::from_yaml(document)
    }
}
