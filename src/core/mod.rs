// src/core/mod.rs

//! The central module containing the multi-cluster runtime core.

pub mod aggregate;
pub mod auth;
pub mod cache;
pub mod clients;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod heartbeat;
pub mod lifecycle;
pub mod metrics;
pub mod refresh;
pub mod runtime;
pub mod scope;
pub mod selection;
pub mod transport;

pub use errors::KubedeckError;
pub use runtime::ClusterRuntime;
pub use selection::{ClusterMeta, ClusterSelection};
