//! # Policy Module
//!
//! Access policies and the record sources they are read from.

pub mod source;
pub mod store;

pub use source::{ConfigMapSource, KubeConfigMapSource, StaticConfigMapSource};
pub use store::{policy_key, policy_record_name, ConfigMapPolicyStore, Policy, PolicyStore};
