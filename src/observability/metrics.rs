//! # Metrics
//!
//! Decision and JWKS counters exported in Prometheus text format.
//!
//! | Metric                                   | Type      | Labels             |
//! |------------------------------------------|-----------|--------------------|
//! | `forward_auth_decisions_total`           | counter   | `outcome`, `status`|
//! | `forward_auth_jwks_fetches_total`        | counter   | `result`           |
//! | `forward_auth_pipeline_duration_seconds` | histogram | `outcome`          |
//!
//! Recording is a no-op until [`install_recorder`] has run, so library users and
//! tests that never install a recorder pay nothing.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

use crate::auth::authorization::AuthDecision;
use crate::core::error::{GatewayError, GatewayResult};

pub const DECISIONS_TOTAL: &str = "forward_auth_decisions_total";
pub const JWKS_FETCHES_TOTAL: &str = "forward_auth_jwks_fetches_total";
pub const PIPELINE_DURATION_SECONDS: &str = "forward_auth_pipeline_duration_seconds";

const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn builder() -> GatewayResult<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(PIPELINE_DURATION_SECONDS.to_string()), DURATION_BUCKETS)
        .map_err(|e| GatewayError::config(format!("Failed to set histogram buckets: {}", e)))
}

/// Install the process-wide Prometheus recorder and return a handle for rendering
pub fn install_recorder() -> GatewayResult<PrometheusHandle> {
    let handle = builder()?
        .install_recorder()
        .map_err(|e| GatewayError::config(format!("Failed to install metrics recorder: {}", e)))?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Record one terminal decision and how long the pipeline took
pub fn record_decision(decision: &AuthDecision, elapsed: Duration) {
    let outcome = decision.outcome();
    counter!(DECISIONS_TOTAL, "outcome" => outcome, "status" => decision.status.as_u16().to_string())
        .increment(1);
    histogram!(PIPELINE_DURATION_SECONDS, "outcome" => outcome).record(elapsed.as_secs_f64());
}
