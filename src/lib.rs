//! # Forward-Auth Gateway Library
//!
//! A forward-authentication service for reverse proxies running in Kubernetes. For each
//! protected request the proxy asks this service for a decision; the service validates
//! the bearer token against the issuer's published keys, checks the route's access
//! policy and answers `200` (forward), `401` (authentication failed) or `403`
//! (no policy or infrastructure failure), always with a correlation id.
//!
//! ## Module Layout
//! - [`core`]: error type, configuration, clock
//! - [`auth`]: correlation, JWKS cache, providers, token validation, authorization, pipeline
//! - [`policy`]: policy records and where they are read from
//! - [`gateway`]: HTTP server and composition
//! - [`observability`]: logging and metrics

/// Error type, configuration and clock abstraction
pub mod core;

/// Token validation, identity providers, authorization and the request pipeline
pub mod auth;

/// Access policies and their record sources
pub mod policy;

/// HTTP server and component wiring
pub mod gateway;

/// Structured logging and Prometheus metrics
pub mod observability;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use gateway::server::{build_components, ForwardAuthServer};
