//! # Configuration Module
//!
//! This module holds the gateway's process-wide settings: where to listen, which header
//! carries the token, how the JWKS cache refreshes, where policies come from, and how
//! logs are written.
//!
//! ## Key Features
//! - YAML configuration parsing with serde (every section has defaults)
//! - Environment variable overrides applied on top of the file
//! - Human-readable durations (`10s`, `5m`) via `humantime`
//! - Validation that reports every problem at once

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};

/// Environment variable naming the optional YAML configuration file
pub const CONFIG_PATH_ENV: &str = "FORWARD_AUTH_CONFIG";

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listener settings
    pub server: ServerConfig,

    /// Bearer token extraction and validation settings
    pub token: TokenConfig,

    /// Signing key cache settings
    pub jwks: JwksConfig,

    /// Identity provider settings
    pub providers: ProvidersConfig,

    /// Access policy source settings
    pub policy: PolicyConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file, apply environment overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `FORWARD_AUTH_CONFIG` when set, otherwise from defaults
    pub async fn load() -> GatewayResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(path).await,
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parse a YAML document without applying overrides
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Variables follow the pattern `FORWARD_AUTH_<SECTION>_<FIELD>`. `SERVER_ADDRESS`
    /// and `ACCESS_TOKEN_HEADER` are accepted for compatibility with existing deployments.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("FORWARD_AUTH_BIND_ADDRESS").or_else(|| lookup("SERVER_ADDRESS")) {
            self.server.bind_address = normalize_bind_address(&addr);
        }

        if let Some(header) = lookup("ACCESS_TOKEN_HEADER") {
            self.token.header_name = header;
        }

        if let Some(skew) = lookup("FORWARD_AUTH_TOKEN_CLOCK_SKEW") {
            self.token.clock_skew = parse_duration("FORWARD_AUTH_TOKEN_CLOCK_SKEW", &skew)?;
        }

        if let Some(interval) = lookup("FORWARD_AUTH_JWKS_MIN_REFRESH") {
            self.jwks.min_refresh_interval = parse_duration("FORWARD_AUTH_JWKS_MIN_REFRESH", &interval)?;
        }

        if let Some(interval) = lookup("FORWARD_AUTH_JWKS_REFRESH_INTERVAL") {
            self.jwks.background_refresh_interval =
                Some(parse_duration("FORWARD_AUTH_JWKS_REFRESH_INTERVAL", &interval)?);
        }

        if let Some(authority) = lookup("FORWARD_AUTH_AZURE_AUTHORITY") {
            self.providers.azure_authority = authority;
        }

        if let Some(source) = lookup("FORWARD_AUTH_POLICY_SOURCE") {
            self.policy.source = match source.to_lowercase().as_str() {
                "kubernetes" => PolicySourceKind::Kubernetes,
                "static" => PolicySourceKind::Static,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid FORWARD_AUTH_POLICY_SOURCE: {}",
                        other
                    )))
                }
            };
        }

        if let Some(namespace) = lookup("FORWARD_AUTH_POLICY_NAMESPACE") {
            self.policy.namespace = Some(namespace);
        }

        if let Some(file) = lookup("FORWARD_AUTH_POLICY_FILE") {
            self.policy.static_file = Some(PathBuf::from(file));
        }

        if let Some(level) = lookup("FORWARD_AUTH_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("FORWARD_AUTH_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid FORWARD_AUTH_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Configuration validation that collects every problem before failing
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!("Invalid bind_address: {}", self.server.bind_address));
        }

        if self.server.request_timeout.is_zero() {
            errors.push("request_timeout must be greater than 0".to_string());
        }

        if self.token.header_name.trim().is_empty() {
            errors.push("token header_name cannot be empty".to_string());
        } else if axum::http::HeaderName::from_bytes(self.token.header_name.as_bytes()).is_err() {
            errors.push(format!("Invalid token header_name: {}", self.token.header_name));
        }

        if self.jwks.min_refresh_interval.is_zero() {
            errors.push("jwks min_refresh_interval must be greater than 0".to_string());
        }

        if self.jwks.fetch_timeout.is_zero() {
            errors.push("jwks fetch_timeout must be greater than 0".to_string());
        }

        if let Some(interval) = self.jwks.background_refresh_interval {
            if interval.is_zero() {
                errors.push("jwks background_refresh_interval must be greater than 0".to_string());
            }
        }

        if self.providers.discovery_timeout.is_zero() {
            errors.push("providers discovery_timeout must be greater than 0".to_string());
        }

        if Url::parse(&self.providers.azure_authority).is_err() {
            errors.push(format!(
                "Invalid providers azure_authority: {}",
                self.providers.azure_authority
            ));
        }

        if self.policy.fetch_timeout.is_zero() {
            errors.push("policy fetch_timeout must be greater than 0".to_string());
        }

        if self.policy.source == PolicySourceKind::Static && self.policy.static_file.is_none() {
            errors.push("policy static_file is required when source is static".to_string());
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> GatewayResult<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e)))
}

/// Accept Go-style `:8080` addresses by binding every interface
fn normalize_bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:8080`
    pub bind_address: String,

    /// Upper bound for serving a single forward-auth request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Read the original method/host/path from `X-Forwarded-*` headers
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout: Duration::from_secs(30),
            trust_forwarded_headers: true,
        }
    }
}

/// Token extraction and validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Header carrying the bearer token
    pub header_name: String,

    /// Tolerance applied to `exp` and `nbf`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Require `iss` to equal the provider issuer
    pub validate_issuer: bool,

    /// Require `aud` to contain the provider client id
    pub validate_audience: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            header_name: "Authorization".to_string(),
            clock_skew: Duration::ZERO,
            validate_issuer: false,
            validate_audience: false,
        }
    }
}

/// Signing key cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// Lower bound for how long a fetched key set is considered fresh
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,

    /// How long to keep serving a stale key set after a failed refresh before retrying
    #[serde(with = "humantime_serde")]
    pub failure_backoff: Duration,

    /// Timeout for a single JWKS fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Period of the background refresher; disabled when absent
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub background_refresh_interval: Option<Duration>,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval: Duration::from_secs(300),
            failure_backoff: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
            background_refresh_interval: None,
        }
    }
}

/// Identity provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Base URL of the Azure AD login authority
    pub azure_authority: String,

    /// Timeout for OIDC discovery requests
    #[serde(with = "humantime_serde")]
    pub discovery_timeout: Duration,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            azure_authority: "https://login.microsoftonline.com".to_string(),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

/// Where policy and provider records are read from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySourceKind {
    /// ConfigMaps in the gateway's namespace
    #[default]
    Kubernetes,
    /// A local YAML file of records (development and tests)
    Static,
}

/// Access policy source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub source: PolicySourceKind,

    /// Namespace holding the records; defaults to the pod's own namespace
    pub namespace: Option<String>,

    /// Record file used by the static source
    pub static_file: Option<PathBuf>,

    /// Timeout for a single record fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            source: PolicySourceKind::Kubernetes,
            namespace: None,
            static_file: None,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}
