pub mod authorization;
pub mod azure;
pub mod correlation;
pub mod jwks;
pub mod middleware;
pub mod oidc;
pub mod providers;
pub mod token;

pub use authorization::{AuthDecision, AuthorizationEngine, RoleUserAuthorizer};
pub use correlation::{CorrelationId, CorrelationTracker, CORRELATION_ID_HEADER};
pub use jwks::{JwksCache, JwksFetcher};
pub use middleware::{ForwardAuthPipeline, ForwardAuthRequest, Stage};
pub use providers::{ProviderConfig, ProviderLoader, ProviderRegistry};
pub use token::{extract_token, Claims, TokenValidator};
