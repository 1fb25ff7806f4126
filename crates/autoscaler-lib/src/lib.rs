//! Node-group autoscaling and vertical recommendations for Magnum clusters
//!
//! This crate provides:
//! - Magnum native and Heat provider adapters behind one node-group engine
//! - Node-group discovery, batching of deletions and size bookkeeping
//! - The vertical resource recommender and its checkpoint store
//! - The OpenStack transport client
//! - Health checks, metrics and the reconcile loop

pub mod api;
pub mod cloudprovider;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod openstack;
pub mod recommender;
pub mod reconcile;

pub use error::{CheckpointError, ModelError, ProviderError, ProviderResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AutoscalerMetrics, StructuredLogger};
pub use reconcile::{ReconcileLoop, TickSummary};
