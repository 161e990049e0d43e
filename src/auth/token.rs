//! # Bearer Token Validation
//!
//! This module extracts the bearer token from the configured header and validates it
//! against the signing keys of the provider named by the route's policy.
//!
//! ## Validation Order
//! 1. Decode the JOSE header without trusting it and read `alg` and `kid`
//! 2. Reject a missing `alg`, `none`, any `HS*` algorithm, or an algorithm the provider
//!    does not advertise, before any cryptographic work
//! 3. Look up the key by `kid` in the provider's key set; there is no fallback to
//!    trying every key
//! 4. Verify the signature (and `iss`/`aud` when configured)
//! 5. Check `exp` (required) and `nbf` (optional) against the injected clock,
//!    with the configured skew

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use axum::http::HeaderMap;

use crate::auth::jwks::JwksCache;
use crate::auth::providers::ProviderConfig;
use crate::core::clock::Clock;
use crate::core::config::TokenConfig;
use crate::core::error::{GatewayError, GatewayResult};

const BEARER_SCHEME: &str = "bearer";

/// Read the token from `header_name`, stripping a `Bearer ` prefix case-insensitively
pub fn extract_token(headers: &HeaderMap, header_name: &str) -> GatewayResult<String> {
    let raw = match headers.get(header_name) {
        Some(value) => value
            .to_str()
            .map_err(|_| GatewayError::malformed("token header is not valid ASCII"))?,
        None => return Err(GatewayError::MissingToken),
    };

    let token = strip_bearer_prefix(raw);
    if token.is_empty() {
        return Err(GatewayError::MissingToken);
    }
    Ok(token.to_string())
}

/// Trim and remove one leading `Bearer` scheme; values without it pass through
///
/// The scheme matches case-insensitively and must be followed by whitespace or
/// nothing at all, so a bare `Bearer` strips to an empty token.
pub fn strip_bearer_prefix(value: &str) -> &str {
    let value = value.trim();
    let rest = match value.get(..BEARER_SCHEME.len()) {
        Some(scheme) if scheme.eq_ignore_ascii_case(BEARER_SCHEME) => &value[BEARER_SCHEME.len()..],
        _ => return value,
    };

    if rest.is_empty() {
        ""
    } else if rest.starts_with(|c: char| c.is_ascii_whitespace()) {
        rest.trim()
    } else {
        // e.g. `bearerish.token`: not the scheme
        value
    }
}

/// Verified, read-only token claims
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The `roles` claim as a set; a single string counts as one role
    pub fn roles(&self) -> HashSet<String> {
        match self.0.get("roles") {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(role)) => HashSet::from([role.clone()]),
            _ => HashSet::new(),
        }
    }

    pub fn preferred_username(&self) -> Option<&str> {
        self.0.get("preferred_username").and_then(Value::as_str)
    }

    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    fn timestamp(&self, name: &str) -> GatewayResult<Option<i64>> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_i64()
                .or_else(|| value.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| GatewayError::malformed(format!("{} claim is not a number", name))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UntrustedHeader {
    alg: Option<String>,
    kid: Option<String>,
}

fn decode_untrusted_header(token: &str) -> GatewayResult<UntrustedHeader> {
    let mut segments = token.split('.');
    let header = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(header), Some(_), Some(_), None) if !header.is_empty() => header,
        _ => return Err(GatewayError::malformed("token must have three segments")),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(header.trim_end_matches('='))
        .map_err(|e| GatewayError::malformed(format!("token header is not base64url: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::malformed(format!("token header is not JSON: {}", e)))
}

fn is_forbidden_algorithm(alg: &str) -> bool {
    alg.eq_ignore_ascii_case("none") || alg.to_ascii_uppercase().starts_with("HS")
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> GatewayError {
    match err.kind() {
        ErrorKind::InvalidSignature => GatewayError::InvalidSignature {
            reason: "signature verification failed".to_string(),
        },
        ErrorKind::InvalidIssuer => GatewayError::InvalidSignature {
            reason: "issuer does not match provider".to_string(),
        },
        ErrorKind::InvalidAudience => GatewayError::InvalidSignature {
            reason: "audience does not match provider".to_string(),
        },
        ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidRsaKey(_)
        | ErrorKind::InvalidEcdsaKey
        | ErrorKind::InvalidKeyFormat
        | ErrorKind::Crypto(_) => GatewayError::InvalidSignature {
            reason: err.to_string(),
        },
        _ => GatewayError::malformed(err.to_string()),
    }
}

/// Validates bearer tokens against provider key sets
#[derive(Debug, Clone)]
pub struct TokenValidator {
    keys: Arc<JwksCache>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
}

impl TokenValidator {
    pub fn new(keys: Arc<JwksCache>, clock: Arc<dyn Clock>, config: TokenConfig) -> Self {
        Self { keys, clock, config }
    }

    pub fn header_name(&self) -> &str {
        &self.config.header_name
    }

    /// Validate `token` for `provider` and return its claims
    pub async fn validate(&self, token: &str, provider: &dyn ProviderConfig) -> GatewayResult<Claims> {
        let header = decode_untrusted_header(token)?;

        let alg = header.alg.ok_or_else(|| GatewayError::UnsupportedAlgorithm {
            alg: "<missing>".to_string(),
        })?;
        if is_forbidden_algorithm(&alg) || !provider.supported_algorithms().contains(&alg) {
            return Err(GatewayError::UnsupportedAlgorithm { alg });
        }
        let algorithm =
            Algorithm::from_str(&alg).map_err(|_| GatewayError::UnsupportedAlgorithm { alg: alg.clone() })?;

        let kid = header.kid.ok_or_else(|| GatewayError::KeyNotFound {
            kid: "<missing>".to_string(),
        })?;

        let key_set = self.keys.get(provider.jwks_location()).await?;
        let jwk = key_set
            .find(&kid)
            .ok_or_else(|| GatewayError::KeyNotFound { kid: kid.clone() })?;
        let key = DecodingKey::from_jwk(jwk).map_err(|e| GatewayError::InvalidSignature {
            reason: format!("key {} is unusable: {}", kid, e),
        })?;

        let validation = self.validation_for(algorithm, provider)?;
        let data = jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(map_jwt_error)?;

        let claims = Claims::new(data.claims);
        self.check_validity_window(&claims)?;

        debug!(
            provider = %provider.name(),
            kid = %kid,
            subject = claims.subject().unwrap_or("<none>"),
            "Token validated"
        );
        Ok(claims)
    }

    fn validation_for(&self, algorithm: Algorithm, provider: &dyn ProviderConfig) -> GatewayResult<Validation> {
        let mut validation = Validation::new(algorithm);
        // Time claims are checked against the injected clock afterwards.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        if self.config.validate_issuer {
            validation.set_issuer(&[provider.issuer_url()]);
        }

        if self.config.validate_audience {
            let audience = provider.audience().ok_or_else(|| {
                GatewayError::config(format!(
                    "audience validation is enabled but provider {} has no client_id",
                    provider.name()
                ))
            })?;
            validation.set_audience(&[audience]);
            validation.validate_aud = true;
        }

        Ok(validation)
    }

    fn check_validity_window(&self, claims: &Claims) -> GatewayResult<()> {
        let now = self.clock.now().timestamp();
        let skew = self.config.clock_skew.as_secs() as i64;

        let exp = claims
            .timestamp("exp")?
            .ok_or_else(|| GatewayError::malformed("token has no exp claim"))?;
        if now >= exp.saturating_add(skew) {
            return Err(GatewayError::Expired { expired_at: exp });
        }

        if let Some(nbf) = claims.timestamp("nbf")? {
            if now.saturating_add(skew) < nbf {
                return Err(GatewayError::NotYetValid { not_before: nbf });
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::auth::jwks::{FetchedKeySet, JwksFetcher};
    use crate::core::clock::ManualClock;
    use crate::core::config::JwksConfig;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;
    const JWKS_URL: &str = "https://issuer.example/keys";

    #[derive(Debug)]
    struct StaticFetcher;

    #[async_trait]
    impl JwksFetcher for StaticFetcher {
        async fn fetch(&self, _location: &str) -> GatewayResult<FetchedKeySet> {
            Ok(FetchedKeySet {
                keys: key_set(TEST_KID),
                max_age: None,
            })
        }
    }

    #[derive(Debug)]
    struct TestProvider {
        algorithms: HashSet<String>,
        audience: Option<String>,
    }

    impl Default for TestProvider {
        fn default() -> Self {
            Self {
                algorithms: HashSet::from(["RS256".to_string()]),
                audience: Some("api://gateway".to_string()),
            }
        }
    }

    impl ProviderConfig for TestProvider {
        fn name(&self) -> &str {
            "test"
        }
        fn provider_type(&self) -> &str {
            "test"
        }
        fn issuer_url(&self) -> &str {
            "https://issuer.example"
        }
        fn jwks_location(&self) -> &str {
            JWKS_URL
        }
        fn supported_algorithms(&self) -> &HashSet<String> {
            &self.algorithms
        }
        fn audience(&self) -> Option<&str> {
            self.audience.as_deref()
        }
    }

    fn validator_with(config: TokenConfig) -> TokenValidator {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc.timestamp_opt(NOW, 0).unwrap()));
        let cache = JwksCache::new(Arc::new(StaticFetcher), clock.clone(), &JwksConfig::default());
        TokenValidator::new(Arc::new(cache), clock, config)
    }

    fn validator() -> TokenValidator {
        validator_with(TokenConfig::default())
    }

    fn claims(exp: i64) -> Value {
        json!({
            "iss": "https://issuer.example",
            "aud": "api://gateway",
            "sub": "user-1",
            "preferred_username": "alice@example.com",
            "roles": ["admin"],
            "exp": exp
        })
    }

    #[test]
    fn test_extract_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("  BeArEr abc.def.ghi  "));
        assert_eq!(extract_token(&headers, "Authorization").unwrap(), "abc.def.ghi");

        headers.insert("authorization", HeaderValue::from_static("abc.def.ghi"));
        assert_eq!(extract_token(&headers, "Authorization").unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_strip_is_idempotent() {
        let once = strip_bearer_prefix("Bearer token-value");
        assert_eq!(strip_bearer_prefix(once), once);
    }

    #[test]
    fn test_extract_token_missing_or_empty() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, "Authorization"), Err(GatewayError::MissingToken));

        headers.insert("authorization", HeaderValue::from_static("Bearer    "));
        assert_eq!(extract_token(&headers, "Authorization"), Err(GatewayError::MissingToken));

        headers.insert("authorization", HeaderValue::from_static("bearer"));
        assert_eq!(extract_token(&headers, "Authorization"), Err(GatewayError::MissingToken));

        headers.insert("authorization", HeaderValue::from_static("\tBEARER\t "));
        assert_eq!(extract_token(&headers, "Authorization"), Err(GatewayError::MissingToken));
    }

    #[test]
    fn test_strip_bearer_prefix_whitespace_variants() {
        assert_eq!(strip_bearer_prefix("Bearer    "), "");
        assert_eq!(strip_bearer_prefix("Bearer"), "");
        assert_eq!(strip_bearer_prefix("Bearer\tabc"), "abc");
        assert_eq!(strip_bearer_prefix("bearer   abc  "), "abc");
        assert_eq!(strip_bearer_prefix("bearerabc"), "bearerabc");
        assert_eq!(strip_bearer_prefix("abc"), "abc");
    }

    #[test]
    fn test_extract_token_custom_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-access-token", HeaderValue::from_static("Bearer t"));
        assert_eq!(extract_token(&headers, "X-Access-Token").unwrap(), "t");
        assert!(extract_token(&headers, "Authorization").is_err());
    }

    #[test]
    fn test_claims_accessors() {
        let claims = Claims::new(claims(NOW).as_object().unwrap().clone());
        assert_eq!(claims.roles(), HashSet::from(["admin".to_string()]));
        assert_eq!(claims.preferred_username(), Some("alice@example.com"));

        let single = Claims::new(json!({ "roles": "reader" }).as_object().unwrap().clone());
        assert!(single.roles().contains("reader"));
        assert!(Claims::default().roles().is_empty());
    }

    #[tokio::test]
    async fn test_valid_token() {
        let token = mint(&claims(NOW + 300), Some(TEST_KID));
        let claims = validator().validate(&token, &TestProvider::default()).await.unwrap();
        assert_eq!(claims.subject(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let token = mint(&claims(NOW - 1), Some(TEST_KID));
        let err = validator().validate(&token, &TestProvider::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::Expired { expired_at: NOW - 1 });

        // exactly at exp is expired with zero skew
        let token = mint(&claims(NOW), Some(TEST_KID));
        assert!(validator().validate(&token, &TestProvider::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_clock_skew_tolerates_recent_expiry() {
        let config = TokenConfig {
            clock_skew: std::time::Duration::from_secs(60),
            ..TokenConfig::default()
        };
        let token = mint(&claims(NOW - 30), Some(TEST_KID));
        assert!(validator_with(config).validate(&token, &TestProvider::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_yet_valid() {
        let mut body = claims(NOW + 300);
        body["nbf"] = json!(NOW + 60);
        let token = mint(&body, Some(TEST_KID));
        let err = validator().validate(&token, &TestProvider::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::NotYetValid { not_before: NOW + 60 });
    }

    #[tokio::test]
    async fn test_missing_exp_is_malformed() {
        let mut body = claims(0);
        body.as_object_mut().unwrap().remove("exp");
        let token = mint(&body, Some(TEST_KID));
        let err = validator().validate(&token, &TestProvider::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::MalformedToken { .. }));
    }

    #[tokio::test]
    async fn test_unknown_kid_has_no_fallback() {
        let token = mint(&claims(NOW + 300), Some("rotated-away"));
        let err = validator().validate(&token, &TestProvider::default()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::KeyNotFound {
                kid: "rotated-away".to_string()
            }
        );

        let token = mint(&claims(NOW + 300), None);
        let err = validator().validate(&token, &TestProvider::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn test_algorithm_checks_run_before_crypto() {
        let body = claims(NOW + 300);
        let provider = TestProvider::default();

        for header in [
            json!({ "typ": "JWT", "kid": TEST_KID }),
            json!({ "alg": "none", "kid": TEST_KID }),
            json!({ "alg": "HS256", "kid": TEST_KID }),
            json!({ "alg": "ES256", "kid": TEST_KID }),
        ] {
            let token = forge(&header, &body);
            let err = validator().validate(&token, &provider).await.unwrap_err();
            assert!(matches!(err, GatewayError::UnsupportedAlgorithm { .. }), "{}", header);
        }
    }

    #[tokio::test]
    async fn test_hs256_rejected_even_when_advertised() {
        let provider = TestProvider {
            algorithms: HashSet::from(["RS256".to_string(), "HS256".to_string()]),
            ..TestProvider::default()
        };
        let token = forge(&json!({ "alg": "HS256", "kid": TEST_KID }), &claims(NOW + 300));
        let err = validator().validate(&token, &provider).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedAlgorithm { .. }));
    }

    #[tokio::test]
    async fn test_tampered_signature() {
        let token = forge(&json!({ "alg": "RS256", "kid": TEST_KID }), &claims(NOW + 300));
        let err = validator().validate(&token, &TestProvider::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSignature { .. }));
    }

    #[tokio::test]
    async fn test_malformed_tokens() {
        for token in ["", "abc", "a.b", "a.b.c.d", "!!!.e30.sig"] {
            let err = validator().validate(token, &TestProvider::default()).await.unwrap_err();
            assert!(matches!(err, GatewayError::MalformedToken { .. }), "{}", token);
        }
    }

    #[tokio::test]
    async fn test_issuer_and_audience_validation() {
        let config = TokenConfig {
            validate_issuer: true,
            validate_audience: true,
            ..TokenConfig::default()
        };
        let token = mint(&claims(NOW + 300), Some(TEST_KID));
        assert!(validator_with(config.clone())
            .validate(&token, &TestProvider::default())
            .await
            .is_ok());

        let mut wrong = claims(NOW + 300);
        wrong["aud"] = json!("api://other");
        let token = mint(&wrong, Some(TEST_KID));
        let err = validator_with(config.clone())
            .validate(&token, &TestProvider::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSignature { .. }));

        let no_audience = TestProvider {
            audience: None,
            ..TestProvider::default()
        };
        let token = mint(&claims(NOW + 300), Some(TEST_KID));
        let err = validator_with(config).validate(&token, &no_audience).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
