//! # Forward-Auth Pipeline
//!
//! This module composes the authorization stages into one strictly linear chain:
//!
//! ```text
//! Started -> CorrelationAssigned -> PolicyLoaded -> ProviderResolved
//!         -> TokenValidated -> Decided -> Terminal(Allowed | Denied)
//! ```
//!
//! Every stage either advances or fails. A failure jumps straight to
//! `Terminal(Denied)` with the status and public message of the error; the remaining
//! stages are skipped and nothing is retried within the request.
//!
//! ## Key Features
//! - Request-scoped accumulator ([`AuthRequestState`]) passed by reference through the stages
//! - Original method/host/path taken from `X-Forwarded-*` headers when trusted
//! - One tracing span per run carrying the correlation id
//! - Full internal error logged server-side, generic message returned to the proxy
//! - Bounded total run time

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, Uri};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::auth::authorization::{AuthDecision, AuthorizationEngine};
use crate::auth::correlation::{CorrelationId, CorrelationTracker};
use crate::auth::providers::{ProviderConfig, ProviderRegistry};
use crate::auth::token::{extract_token, Claims, TokenValidator};
use crate::core::error::{FetchFailure, GatewayError, GatewayResult};
use crate::observability::metrics::record_decision;
use crate::policy::store::{Policy, PolicyStore};

pub const FORWARDED_METHOD_HEADER: &str = "x-forwarded-method";
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";
pub const FORWARDED_URI_HEADER: &str = "x-forwarded-uri";

/// Final outcome of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    Allowed,
    Denied,
}

/// Position of a request in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Started,
    CorrelationAssigned,
    PolicyLoaded,
    ProviderResolved,
    TokenValidated,
    Decided,
    Terminal(Outcome),
}

/// What the proxy tells us about the original request
#[derive(Debug, Clone)]
pub struct ForwardAuthRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    pub headers: HeaderMap,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl ForwardAuthRequest {
    /// Build from the incoming call, preferring `X-Forwarded-*` when `trust_forwarded` is set
    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap, trust_forwarded: bool) -> Self {
        let forwarded = |name: &str| {
            if trust_forwarded {
                header_str(headers, name)
            } else {
                None
            }
        };

        let method = forwarded(FORWARDED_METHOD_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| method.as_str().to_string());

        let host = forwarded(FORWARDED_HOST_HEADER)
            // X-Forwarded-Host may be a list; the first entry is the client-facing host
            .and_then(|hosts| hosts.split(',').next())
            .map(str::trim)
            .or_else(|| header_str(headers, "host"))
            .or_else(|| uri.host())
            .unwrap_or_default()
            .to_string();

        let path = forwarded(FORWARDED_URI_HEADER)
            .map(|forwarded_uri| forwarded_uri.split('?').next().unwrap_or(forwarded_uri))
            .unwrap_or_else(|| uri.path())
            .to_string();

        Self {
            method,
            host,
            path,
            headers: headers.clone(),
        }
    }

    pub fn from_request(request: &Request, trust_forwarded: bool) -> Self {
        Self::from_parts(request.method(), request.uri(), request.headers(), trust_forwarded)
    }
}

/// Request-scoped accumulator threaded through every stage
pub struct AuthRequestState {
    correlation_id: CorrelationId,
    stage: Stage,
    policy: Option<Policy>,
    provider: Option<Arc<dyn ProviderConfig>>,
    claims: Option<Claims>,
    decision: Option<AuthDecision>,
}

impl fmt::Debug for AuthRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequestState")
            .field("correlation_id", &self.correlation_id)
            .field("stage", &self.stage)
            .field("policy", &self.policy)
            .field("provider", &self.provider.as_ref().map(|p| p.name()))
            .field("has_claims", &self.claims.is_some())
            .field("decision", &self.decision)
            .finish()
    }
}

impl AuthRequestState {
    pub fn new(correlation_id: CorrelationId) -> Self {
        let mut state = Self {
            correlation_id,
            stage: Stage::Started,
            policy: None,
            provider: None,
            claims: None,
            decision: None,
        };
        state.advance(Stage::CorrelationAssigned);
        state
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn decision(&self) -> Option<&AuthDecision> {
        self.decision.as_ref()
    }

    fn advance(&mut self, to: Stage) {
        debug_assert!(to > self.stage, "pipeline stages only move forward");
        debug!(from = ?self.stage, to = ?to, "Pipeline stage transition");
        self.stage = to;
    }

    fn missing(&self, what: &str) -> GatewayError {
        GatewayError::internal(format!("{} unavailable at stage {:?}", what, self.stage))
    }

    fn policy(&self) -> GatewayResult<&Policy> {
        self.policy.as_ref().ok_or_else(|| self.missing("policy"))
    }

    fn provider(&self) -> GatewayResult<Arc<dyn ProviderConfig>> {
        self.provider.clone().ok_or_else(|| self.missing("provider"))
    }

    fn claims(&self) -> GatewayResult<&Claims> {
        self.claims.as_ref().ok_or_else(|| self.missing("claims"))
    }

    fn finish(&mut self, decision: AuthDecision) {
        let outcome = if decision.allowed {
            Outcome::Allowed
        } else {
            Outcome::Denied
        };
        self.stage = Stage::Terminal(outcome);
        self.decision = Some(decision);
    }
}

/// The composed forward-auth chain
#[derive(Debug, Clone)]
pub struct ForwardAuthPipeline {
    policy_store: Arc<dyn PolicyStore>,
    providers: Arc<ProviderRegistry>,
    validator: TokenValidator,
    engine: Arc<dyn AuthorizationEngine>,
    request_timeout: Duration,
    trust_forwarded_headers: bool,
}

impl ForwardAuthPipeline {
    pub fn new(
        policy_store: Arc<dyn PolicyStore>,
        providers: Arc<ProviderRegistry>,
        validator: TokenValidator,
        engine: Arc<dyn AuthorizationEngine>,
    ) -> Self {
        Self {
            policy_store,
            providers,
            validator,
            engine,
            request_timeout: Duration::from_secs(30),
            trust_forwarded_headers: true,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn trust_forwarded_headers(&self) -> bool {
        self.trust_forwarded_headers
    }

    /// Run every stage for `request` and return the terminal decision
    pub async fn run(&self, request: &ForwardAuthRequest, correlation_id: CorrelationId) -> AuthDecision {
        let mut state = AuthRequestState::new(correlation_id);
        self.run_with_state(request, &mut state).await
    }

    /// Like [`run`](Self::run), leaving the accumulator for inspection
    pub async fn run_with_state(&self, request: &ForwardAuthRequest, state: &mut AuthRequestState) -> AuthDecision {
        let started = Instant::now();
        let span = info_span!(
            "forward_auth",
            correlation_id = %state.correlation_id(),
            method = %request.method,
            host = %request.host,
            path = %request.path,
        );

        let result = match tokio::time::timeout(
            self.request_timeout,
            self.execute(request, state).instrument(span.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::fetch(
                "forward-auth pipeline",
                FetchFailure::Timeout {
                    timeout_ms: self.request_timeout.as_millis() as u64,
                },
            )),
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(err) => {
                span.in_scope(|| {
                    if err.is_client_error() {
                        warn!(error = %err, error_type = err.error_type(), stage = ?state.stage(), "Request denied");
                    } else {
                        error!(error = %err, error_type = err.error_type(), stage = ?state.stage(), "Request denied by infrastructure failure");
                    }
                });
                AuthDecision::deny(&err, state.correlation_id().clone())
            }
        };

        state.finish(decision.clone());
        record_decision(&decision, started.elapsed());
        span.in_scope(|| debug!(status = decision.status.as_u16(), "Forward-auth decision"));
        decision
    }

    async fn execute(&self, request: &ForwardAuthRequest, state: &mut AuthRequestState) -> GatewayResult<AuthDecision> {
        self.load_policy(request, state).await?;
        self.resolve_provider(state).await?;
        self.validate_token(request, state).await?;
        self.decide(state)
    }

    async fn load_policy(&self, request: &ForwardAuthRequest, state: &mut AuthRequestState) -> GatewayResult<()> {
        let policy = self
            .policy_store
            .get_policy(&request.host, &request.path, &request.method)
            .await?;
        state.policy = Some(policy);
        state.advance(Stage::PolicyLoaded);
        Ok(())
    }

    async fn resolve_provider(&self, state: &mut AuthRequestState) -> GatewayResult<()> {
        let policy = state.policy()?;
        let provider = self
            .providers
            .resolve(&policy.provider_type, &policy.provider_name)
            .await?;
        state.provider = Some(provider);
        state.advance(Stage::ProviderResolved);
        Ok(())
    }

    async fn validate_token(&self, request: &ForwardAuthRequest, state: &mut AuthRequestState) -> GatewayResult<()> {
        let provider = state.provider()?;
        let token = extract_token(&request.headers, self.validator.header_name())?;
        let claims = self.validator.validate(&token, provider.as_ref()).await?;
        state.claims = Some(claims);
        state.advance(Stage::TokenValidated);
        Ok(())
    }

    fn decide(&self, state: &mut AuthRequestState) -> GatewayResult<AuthDecision> {
        let decision = self
            .engine
            .decide(state.claims()?, state.policy()?, state.correlation_id());
        state.advance(Stage::Decided);
        Ok(decision)
    }
}

/// Terminal responder: run the pipeline for the incoming call and answer the proxy
pub async fn forward_auth(State(pipeline): State<Arc<ForwardAuthPipeline>>, request: Request) -> AuthDecision {
    let correlation_id = CorrelationTracker::get_or_unknown(&request);
    let auth_request = ForwardAuthRequest::from_request(&request, pipeline.trust_forwarded_headers());
    pipeline.run(&auth_request, correlation_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::authorization::RoleUserAuthorizer;
    use crate::auth::jwks::{FetchedKeySet, JwksCache, JwksFetcher};
    use crate::auth::providers::ProviderLoader;
    use crate::auth::token::fixtures::{key_set, mint, TEST_KID};
    use crate::core::clock::SystemClock;
    use crate::core::config::{JwksConfig, TokenConfig};
    use crate::policy::source::{ConfigMapSource, StaticConfigMapSource};
    use crate::policy::store::ConfigMapPolicyStore;
    use async_trait::async_trait;
    use axum::http::{HeaderValue, StatusCode};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct KeysFetcher;

    #[async_trait]
    impl JwksFetcher for KeysFetcher {
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
    }

    impl ProviderConfig for TestProvider {
        fn name(&self) -> &str {
            "idp"
        }
        fn provider_type(&self) -> &str {
            "test"
        }
        fn issuer_url(&self) -> &str {
            "https://idp.example"
        }
        fn jwks_location(&self) -> &str {
            "https://idp.example/keys"
        }
        fn supported_algorithms(&self) -> &HashSet<String> {
            &self.algorithms
        }
    }

    #[derive(Debug, Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ProviderLoader for CountingLoader {
        async fn load(&self, _name: &str, _source: &dyn ConfigMapSource) -> GatewayResult<Arc<dyn ProviderConfig>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestProvider {
                algorithms: HashSet::from(["RS256".to_string()]),
            }))
        }
    }

    fn pipeline(loader: Arc<CountingLoader>) -> ForwardAuthPipeline {
        let source: Arc<dyn ConfigMapSource> = Arc::new(StaticConfigMapSource::default().with_record(
            "access_policy_api_example_com",
            [
                ("data_get", "roles: [admin]\nusers: [carol]\nprovider_name: idp\nprovider_type: test"),
                ("other_get", "roles: [admin]\nprovider_name: idp\nprovider_type: okta"),
            ],
        ));
        let store = Arc::new(ConfigMapPolicyStore::new(source.clone()));
        let registry = Arc::new(ProviderRegistry::new(source).with_loader(&["test"], loader));
        let clock = Arc::new(SystemClock);
        let cache = Arc::new(JwksCache::new(Arc::new(KeysFetcher), clock.clone(), &JwksConfig::default()));
        let validator = TokenValidator::new(cache, clock, TokenConfig::default());
        ForwardAuthPipeline::new(store, registry, validator, Arc::new(RoleUserAuthorizer))
    }

    fn request(path: &str, token: Option<&str>) -> ForwardAuthRequest {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
            );
        }
        ForwardAuthRequest {
            method: "GET".to_string(),
            host: "api.example.com".to_string(),
            path: path.to_string(),
            headers,
        }
    }

    fn token(roles: &[&str], username: &str) -> String {
        let exp = chrono::Utc::now().timestamp() + 300;
        mint(
            &json!({ "roles": roles, "preferred_username": username, "exp": exp }),
            Some(TEST_KID),
        )
    }

    #[tokio::test]
    async fn test_allowed_request_reaches_terminal_allowed() {
        let pipeline = pipeline(Arc::new(CountingLoader::default()));
        let mut state = AuthRequestState::new(CorrelationId::generate());
        let token = token(&["admin"], "alice@example.com");

        let decision = pipeline.run_with_state(&request("/data", Some(&token)), &mut state).await;

        assert!(decision.allowed);
        assert_eq!(decision.status, StatusCode::OK);
        assert_eq!(state.stage(), Stage::Terminal(Outcome::Allowed));
        assert_eq!(state.decision(), Some(&decision));
    }

    #[tokio::test]
    async fn test_user_match_allows() {
        let pipeline = pipeline(Arc::new(CountingLoader::default()));
        let token = token(&[], "carol@example.com");
        let decision = pipeline.run(&request("/data", Some(&token)), CorrelationId::generate()).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_missing_policy_short_circuits() {
        let loader = Arc::new(CountingLoader::default());
        let pipeline = pipeline(loader.clone());
        let mut state = AuthRequestState::new(CorrelationId::generate());

        let decision = pipeline.run_with_state(&request("/unknown", None), &mut state).await;

        assert_eq!(decision.status, StatusCode::FORBIDDEN);
        assert_eq!(state.stage(), Stage::Terminal(Outcome::Denied));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_type_is_forbidden() {
        let pipeline = pipeline(Arc::new(CountingLoader::default()));
        let token = token(&["admin"], "alice");
        let decision = pipeline.run(&request("/other", Some(&token)), CorrelationId::generate()).await;
        assert_eq!(decision.status, StatusCode::FORBIDDEN);
        assert_eq!(decision.message, "Error occurred, please contact support");
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let pipeline = pipeline(Arc::new(CountingLoader::default()));
        let decision = pipeline.run(&request("/data", None), CorrelationId::generate()).await;
        assert_eq!(decision.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_role_mismatch_is_unauthorized() {
        let pipeline = pipeline(Arc::new(CountingLoader::default()));
        let token = token(&["reader"], "bob@example.com");
        let decision = pipeline.run(&request("/data", Some(&token)), CorrelationId::generate()).await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_provider_resolved_once_across_requests() {
        let loader = Arc::new(CountingLoader::default());
        let pipeline = pipeline(loader.clone());
        let token = token(&["admin"], "alice");
        for _ in 0..3 {
            pipeline.run(&request("/data", Some(&token)), CorrelationId::generate()).await;
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Default)]
    struct RecordingEngine {
        decisions: AtomicUsize,
    }

    impl AuthorizationEngine for RecordingEngine {
        fn authorize(&self, _claims: &Claims, _policy: &Policy) -> GatewayResult<()> {
            Err(GatewayError::denied("no matching role"))
        }

        fn decide(&self, claims: &Claims, policy: &Policy, correlation_id: &CorrelationId) -> AuthDecision {
            self.decisions.fetch_add(1, Ordering::SeqCst);
            match self.authorize(claims, policy) {
                Ok(()) => AuthDecision::allow(correlation_id.clone()),
                Err(err) => AuthDecision::deny(&err, correlation_id.clone()),
            }
        }
    }

    #[tokio::test]
    async fn test_decision_comes_from_engine_decide() {
        let engine = Arc::new(RecordingEngine::default());
        let base = pipeline(Arc::new(CountingLoader::default()));
        let pipeline = ForwardAuthPipeline::new(
            base.policy_store.clone(),
            base.providers.clone(),
            base.validator.clone(),
            engine.clone(),
        );
        let correlation_id = CorrelationId::generate();
        let mut state = AuthRequestState::new(correlation_id.clone());
        let token = token(&["admin"], "alice");

        let decision = pipeline.run_with_state(&request("/data", Some(&token)), &mut state).await;

        assert_eq!(engine.decisions.load(Ordering::SeqCst), 1);
        assert_eq!(decision.status, StatusCode::UNAUTHORIZED);
        assert_eq!(decision.correlation_id, correlation_id);
        assert_eq!(state.stage(), Stage::Terminal(Outcome::Denied));
    }

    #[test]
    fn test_forwarded_headers_win_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("forward-auth.internal:8080"));
        headers.insert(FORWARDED_METHOD_HEADER, HeaderValue::from_static("POST"));
        headers.insert(FORWARDED_HOST_HEADER, HeaderValue::from_static("api.example.com, proxy.local"));
        headers.insert(FORWARDED_URI_HEADER, HeaderValue::from_static("/api/data?page=2"));
        let uri: Uri = "/auth".parse().unwrap();

        let trusted = ForwardAuthRequest::from_parts(&Method::GET, &uri, &headers, true);
        assert_eq!(trusted.method, "POST");
        assert_eq!(trusted.host, "api.example.com");
        assert_eq!(trusted.path, "/api/data");

        let direct = ForwardAuthRequest::from_parts(&Method::GET, &uri, &headers, false);
        assert_eq!(direct.method, "GET");
        assert_eq!(direct.host, "forward-auth.internal:8080");
        assert_eq!(direct.path, "/auth");
    }

    #[test]
    fn test_stages_are_ordered() {
        assert!(Stage::Started < Stage::CorrelationAssigned);
        assert!(Stage::TokenValidated < Stage::Decided);
        assert!(Stage::Decided < Stage::Terminal(Outcome::Allowed));
        assert!(Stage::Decided < Stage::Terminal(Outcome::Denied));
        let state = AuthRequestState::new(CorrelationId::unknown());
        assert_eq!(state.stage(), Stage::CorrelationAssigned);
    }
}
