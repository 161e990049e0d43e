//! # Identity Providers
//!
//! A policy names the provider that issues tokens for its route by `(provider_type,
//! provider_name)`. This module turns that pair into a [`ProviderConfig`]: the issuer,
//! where its signing keys live, and which algorithms it signs with.
//!
//! ## Key Features
//! - [`ProviderConfig`] capability trait consumed by the token validator
//! - [`ProviderLoader`] strategy per provider type, registered by type name
//! - Case-insensitive type lookup; unknown types are a configuration error
//! - Process-wide cache of resolved configs so discovery runs once per provider,
//!   even when many requests resolve the same provider concurrently
//!
//! Adding a provider type means implementing [`ProviderLoader`] and registering it;
//! nothing in the validator changes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::policy::source::ConfigMapSource;

/// Resolved settings of one identity provider
pub trait ProviderConfig: Send + Sync + fmt::Debug {
    /// Provider name as referenced by policies
    fn name(&self) -> &str;

    /// Canonical provider type
    fn provider_type(&self) -> &str;

    /// Expected `iss` of tokens from this provider
    fn issuer_url(&self) -> &str;

    /// URL of the provider's JWKS document
    fn jwks_location(&self) -> &str;

    /// Signing algorithms the provider uses for ID tokens
    fn supported_algorithms(&self) -> &HashSet<String>;

    /// Expected `aud`, when the provider record names one
    fn audience(&self) -> Option<&str> {
        None
    }
}

/// Builds a [`ProviderConfig`] for one provider type
#[async_trait]
pub trait ProviderLoader: Send + Sync + fmt::Debug {
    async fn load(
        &self,
        provider_name: &str,
        source: &dyn ConfigMapSource,
    ) -> GatewayResult<Arc<dyn ProviderConfig>>;
}

type ResolvedSlot = Arc<OnceCell<Arc<dyn ProviderConfig>>>;

/// Resolves and caches provider configs by `(provider_type, provider_name)`
#[derive(Debug)]
pub struct ProviderRegistry {
    source: Arc<dyn ConfigMapSource>,
    loaders: HashMap<String, Arc<dyn ProviderLoader>>,
    resolved: DashMap<(String, String), ResolvedSlot>,
}

impl ProviderRegistry {
    pub fn new(source: Arc<dyn ConfigMapSource>) -> Self {
        Self {
            source,
            loaders: HashMap::new(),
            resolved: DashMap::new(),
        }
    }

    /// Register `loader` under every name in `provider_types`
    pub fn with_loader(mut self, provider_types: &[&str], loader: Arc<dyn ProviderLoader>) -> Self {
        for provider_type in provider_types {
            self.loaders
                .insert(provider_type.trim().to_lowercase(), loader.clone());
        }
        self
    }

    /// Provider type names with a registered loader
    pub fn provider_types(&self) -> Vec<&str> {
        self.loaders.keys().map(String::as_str).collect()
    }

    /// Resolve a provider, loading it on first use
    ///
    /// A failed load is not cached; the next request tries again.
    pub async fn resolve(
        &self,
        provider_type: &str,
        provider_name: &str,
    ) -> GatewayResult<Arc<dyn ProviderConfig>> {
        let type_key = provider_type.trim().to_lowercase();
        let loader = self.loaders.get(&type_key).cloned().ok_or_else(|| {
            GatewayError::config(format!("unsupported provider type: {}", provider_type))
        })?;

        let slot: ResolvedSlot = self
            .resolved
            .entry((type_key, provider_name.to_string()))
            .or_default()
            .clone();

        let config = slot
            .get_or_try_init(|| async {
                debug!(provider_type = %provider_type, provider = %provider_name, "Loading provider config");
                loader.load(provider_name, self.source.as_ref()).await
            })
            .await?;

        Ok(config.clone())
    }
}
