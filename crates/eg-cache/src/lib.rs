//! EventGate admission caches
//!
//! This crate holds the two independently-lifecycled caches behind the
//! admission pipeline:
//! - AuthorizationCache: (environment, event type) -> allowed publisher ids,
//!   fed by subscription resource-lifecycle notifications
//! - SchemaCache: (environment, event type, hub, team) -> compiled schema or
//!   negative entry, populated lazily per environment and refreshed by a
//!   periodic poll against the remote specification registry

pub mod authorization;
pub mod refresh;
pub mod registry;
pub mod schema;

pub use authorization::{AuthorizationCache, SubscriptionWatcher};
pub use refresh::{SchemaRefreshConfig, SchemaRefreshTask};
pub use registry::{
    EventSpecification, HttpRegistryConfig, HttpSpecificationRegistry, RegistryError,
    SpecificationRegistry,
};
pub use schema::{SchemaCache, SchemaCacheEntry, SchemaKey};
