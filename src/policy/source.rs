//! # Record Sources
//!
//! Policies and provider settings are stored as named string maps. In a cluster those
//! are ConfigMaps in the gateway's namespace; for local runs and tests they come from a
//! YAML file or an in-memory table.
//!
//! ## Key Features
//! - [`ConfigMapSource`] trait shared by the policy store and the provider loaders
//! - Kubernetes implementation on top of `kube`, with a bounded per-call timeout
//! - Static implementation loadable from YAML

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::config::PolicyConfig;
use crate::core::error::{FetchFailure, GatewayError, GatewayResult};

/// File holding the pod's own namespace when running in a cluster
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Data of a single named record
pub type RecordData = BTreeMap<String, String>;

/// Read access to named string-map records
#[async_trait]
pub trait ConfigMapSource: Send + Sync + fmt::Debug {
    /// Fetch a record by name; `Ok(None)` means it does not exist
    async fn get(&self, name: &str) -> GatewayResult<Option<RecordData>>;
}

/// Records backed by Kubernetes ConfigMaps
#[derive(Clone)]
pub struct KubeConfigMapSource {
    api: Api<ConfigMap>,
    namespace: String,
    timeout: Duration,
}

impl fmt::Debug for KubeConfigMapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeConfigMapSource")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl KubeConfigMapSource {
    pub fn new(client: Client, namespace: impl Into<String>, timeout: Duration) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            timeout,
        }
    }

    /// Connect using the ambient cluster configuration
    pub async fn connect(config: &PolicyConfig) -> GatewayResult<Self> {
        let client = Client::try_default().await?;
        let namespace = match &config.namespace {
            Some(namespace) => namespace.clone(),
            None => read_service_account_namespace(SERVICE_ACCOUNT_NAMESPACE_FILE).await?,
        };
        info!(namespace = %namespace, "Reading policy records from Kubernetes ConfigMaps");
        Ok(Self::new(client, namespace, config.fetch_timeout))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl ConfigMapSource for KubeConfigMapSource {
    async fn get(&self, name: &str) -> GatewayResult<Option<RecordData>> {
        debug!(namespace = %self.namespace, configmap = %name, "Fetching ConfigMap");
        let target = format!("configmap/{}/{}", self.namespace, name);

        let config_map = tokio::time::timeout(self.timeout, self.api.get_opt(name))
            .await
            .map_err(|_| {
                GatewayError::fetch(
                    target.as_str(),
                    FetchFailure::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    },
                )
            })?
            .map_err(|err| match GatewayError::from(err) {
                GatewayError::UpstreamFetch { failure, .. } => GatewayError::fetch(target.as_str(), failure),
                other => other,
            })?;

        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }
}

/// Read the namespace the pod runs in
pub async fn read_service_account_namespace<P: AsRef<Path>>(path: P) -> GatewayResult<String> {
    let namespace = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
        GatewayError::config(format!(
            "policy namespace not configured and {} is unreadable: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    let namespace = namespace.trim();
    if namespace.is_empty() {
        return Err(GatewayError::config("service account namespace file is empty"));
    }
    Ok(namespace.to_string())
}

/// Records held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticConfigMapSource {
    records: HashMap<String, RecordData>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct StaticRecords(HashMap<String, RecordData>);

impl StaticConfigMapSource {
    pub fn new(records: HashMap<String, RecordData>) -> Self {
        Self { records }
    }

    /// Add or replace a record
    pub fn with_record<I, K, V>(mut self, name: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let data = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.records.insert(name.into(), data);
        self
    }

    /// Parse a YAML mapping of record name to entries
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let StaticRecords(records) = serde_yaml::from_str(content)?;
        Ok(Self { records })
    }

    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            GatewayError::config(format!(
                "Failed to read policy file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let source = Self::from_yaml(&content)?;
        info!(
            file = %path.as_ref().display(),
            records = source.records.len(),
            "Loaded static policy records"
        );
        Ok(source)
    }
}

#[async_trait]
impl ConfigMapSource for StaticConfigMapSource {
    async fn get(&self, name: &str) -> GatewayResult<Option<RecordData>> {
        Ok(self.records.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RECORDS: &str = r#"
access_policy_api_example_com:
  data_get: |
    roles: [admin]
    provider_name: azure_prod
    provider_type: azure
azure_prod:
  tenant_id: 0000-tenant
"#;

    #[tokio::test]
    async fn test_static_source_from_yaml() {
        let source = StaticConfigMapSource::from_yaml(RECORDS).unwrap();

        let policy = source.get("access_policy_api_example_com").await.unwrap().unwrap();
        assert!(policy["data_get"].contains("roles: [admin]"));

        let provider = source.get("azure_prod").await.unwrap().unwrap();
        assert_eq!(provider["tenant_id"], "0000-tenant");

        assert!(source.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_record_replaces_existing() {
        let source = StaticConfigMapSource::default()
            .with_record("a", [("k", "1")])
            .with_record("a", [("k", "2")]);
        assert_eq!(source.get("a").await.unwrap().unwrap()["k"], "2");
    }

    #[test]
    fn test_invalid_yaml_is_configuration_error() {
        let err = StaticConfigMapSource::from_yaml("- just\n- a list").unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RECORDS.as_bytes()).unwrap();

        let source = StaticConfigMapSource::load_from_file(file.path()).await.unwrap();
        assert!(source.get("azure_prod").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_service_account_namespace_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"auth-system\n").unwrap();
        let namespace = read_service_account_namespace(file.path()).await.unwrap();
        assert_eq!(namespace, "auth-system");
    }

    #[tokio::test]
    async fn test_missing_namespace_file_is_configuration_error() {
        let err = read_service_account_namespace("/nonexistent/namespace").await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
