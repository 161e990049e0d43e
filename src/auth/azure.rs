//! # Azure AD Provider
//!
//! Azure AD providers are described by a record named after the provider with a
//! required `tenant_id` and an optional `client_id`. The issuer is
//! `{authority}/{tenant_id}/v2.0`; the key location and signing algorithms come from
//! the issuer's OIDC discovery document.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::auth::oidc::DiscoveryClient;
use crate::auth::providers::{ProviderConfig, ProviderLoader};
use crate::core::error::{GatewayError, GatewayResult};
use crate::policy::source::ConfigMapSource;

/// Canonical provider type
pub const AZURE_PROVIDER_TYPE: &str = "azure";

/// Provider type names accepted in policies for Azure AD
pub const AZURE_PROVIDER_TYPES: [&str; 2] = [AZURE_PROVIDER_TYPE, "azure_auth_provider"];

const TENANT_ID_KEY: &str = "tenant_id";
const CLIENT_ID_KEY: &str = "client_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureProviderConfig {
    pub name: String,
    pub tenant_id: String,
    pub client_id: Option<String>,
    pub issuer_url: String,
    pub jwks_location: String,
    pub algorithms: HashSet<String>,
}

impl ProviderConfig for AzureProviderConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &str {
        AZURE_PROVIDER_TYPE
    }

    fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    fn jwks_location(&self) -> &str {
        &self.jwks_location
    }

    fn supported_algorithms(&self) -> &HashSet<String> {
        &self.algorithms
    }

    fn audience(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Loads Azure AD provider records and runs discovery for them
#[derive(Debug, Clone)]
pub struct AzureProviderLoader {
    authority: String,
    discovery: Arc<dyn DiscoveryClient>,
}

impl AzureProviderLoader {
    pub fn new(authority: impl Into<String>, discovery: Arc<dyn DiscoveryClient>) -> Self {
        Self {
            authority: authority.into(),
            discovery,
        }
    }

    pub fn issuer_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/v2.0", self.authority.trim_end_matches('/'), tenant_id)
    }
}

#[async_trait]
impl ProviderLoader for AzureProviderLoader {
    async fn load(
        &self,
        provider_name: &str,
        source: &dyn ConfigMapSource,
    ) -> GatewayResult<Arc<dyn ProviderConfig>> {
        let record = source.get(provider_name).await?.ok_or_else(|| {
            GatewayError::config(format!("provider record {} not found", provider_name))
        })?;

        let field = |key: &str| {
            record
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let tenant_id = field(TENANT_ID_KEY).ok_or_else(|| {
            GatewayError::config(format!(
                "provider record {} has no {}",
                provider_name, TENANT_ID_KEY
            ))
        })?;
        let client_id = field(CLIENT_ID_KEY);

        let issuer_url = self.issuer_url(&tenant_id);
        let discovered = self.discovery.discover(&issuer_url).await?;

        info!(
            provider = %provider_name,
            issuer = %issuer_url,
            jwks_uri = %discovered.jwks_uri,
            algorithms = ?discovered.signing_algorithms,
            "Resolved Azure AD provider"
        );

        Ok(Arc::new(AzureProviderConfig {
            name: provider_name.to_string(),
            tenant_id,
            client_id,
            issuer_url,
            jwks_location: discovered.jwks_uri,
            algorithms: discovered.signing_algorithms,
        }))
    }
}
