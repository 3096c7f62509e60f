//! SchemaCache - compiled validation outcomes per (environment, type, hub, team)
//!
//! Populated lazily: the first lookup for an environment polls the registry
//! synchronously (bounded by a timeout), every later cycle of the refresh task
//! re-polls environments that have been looked up at least once. Registry
//! unreachability fails open: the lookup returns nothing, schema validation is
//! skipped, and the environment stays unmarked so the next lookup retries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};

use crate::registry::{EventSpecification, RegistryError, SpecificationRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub environment: String,
    pub event_type: String,
    pub hub: String,
    pub team: String,
}

impl SchemaKey {
    pub fn new(environment: &str, event_type: &str, hub: &str, team: &str) -> Self {
        Self {
            environment: environment.to_string(),
            event_type: event_type.to_string(),
            hub: hub.to_string(),
            team: team.to_string(),
        }
    }

    /// Derives a key from a polled specification. `None` when any field is
    /// absent or empty: such a specification is never cached because no
    /// schema can be clearly assigned.
    fn from_specification(environment: &str, spec: &EventSpecification) -> Option<Self> {
        let hub = spec.hub.as_deref().filter(|v| !v.trim().is_empty())?;
        let team = spec.team.as_deref().filter(|v| !v.trim().is_empty())?;
        if environment.trim().is_empty() || spec.event_type.trim().is_empty() {
            return None;
        }
        Some(Self::new(environment, &spec.event_type, hub, team))
    }
}

/// Cached compile outcome. `is_valid == false` is a negative entry: the
/// specification is remembered as broken so it is never recompiled on lookup,
/// only on the next poll cycle.
#[derive(Debug, Clone)]
pub struct SchemaCacheEntry {
    pub is_valid: bool,
    pub schema: Option<Arc<jsonschema::Validator>>,
}

impl SchemaCacheEntry {
    fn valid(schema: jsonschema::Validator) -> Self {
        Self {
            is_valid: true,
            schema: Some(Arc::new(schema)),
        }
    }

    fn invalid() -> Self {
        Self {
            is_valid: false,
            schema: None,
        }
    }
}

pub struct SchemaCache {
    registry: Arc<dyn SpecificationRegistry>,
    schemas: DashMap<SchemaKey, SchemaCacheEntry>,
    polled_environments: DashSet<String>,
    poll_timeout: Duration,
}

impl SchemaCache {
    pub fn new(registry: Arc<dyn SpecificationRegistry>, poll_timeout: Duration) -> Self {
        Self {
            registry,
            schemas: DashMap::new(),
            polled_environments: DashSet::new(),
            poll_timeout,
        }
    }

    /// Looks up the cached outcome for an event type, polling the registry
    /// first if this environment has never been polled. Returns `None` when
    /// no specification is known for the key, or when the registry could not
    /// be reached (fail-open: the caller skips schema validation and the next
    /// lookup retries the poll).
    pub async fn schema_for_event_type(
        &self,
        environment: &str,
        event_type: &str,
        hub: &str,
        team: &str,
    ) -> Option<SchemaCacheEntry> {
        if !self.polled_environments.contains(environment) {
            match tokio::time::timeout(self.poll_timeout, self.poll_environment(environment)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        environment = %environment,
                        event_type = %event_type,
                        "Could not reach specification registry, skipping schema validation: {e}"
                    );
                    return None;
                }
                Err(_) => {
                    warn!(
                        environment = %environment,
                        event_type = %event_type,
                        "Specification registry poll timed out, skipping schema validation"
                    );
                    return None;
                }
            }
        }

        let key = SchemaKey::new(environment, event_type, hub, team);
        self.schemas.get(&key).map(|entry| entry.clone())
    }

    /// Fetches the full specification list for an environment and applies it
    /// to the cache. The environment is marked polled only after a poll
    /// attempt completes without a connectivity failure; per-specification
    /// compile failures do not block marking.
    pub async fn poll_environment(&self, environment: &str) -> Result<(), RegistryError> {
        let specifications = self.registry.fetch_all_specifications(environment).await?;
        debug!(
            environment = %environment,
            count = specifications.len(),
            "Applying polled specifications"
        );

        for spec in specifications {
            self.apply_specification(environment, spec);
        }

        self.polled_environments.insert(environment.to_string());
        Ok(())
    }

    /// Re-polls every environment that has been looked up at least once.
    /// Environments nobody publishes to are never polled.
    pub async fn refresh_polled_environments(&self) {
        let environments: Vec<String> =
            self.polled_environments.iter().map(|e| e.key().clone()).collect();

        for environment in environments {
            if let Err(e) = self.poll_environment(&environment).await {
                warn!(
                    environment = %environment,
                    "Scheduled specification poll failed: {e}"
                );
            }
        }
    }

    fn apply_specification(&self, environment: &str, spec: EventSpecification) {
        let Some(key) = SchemaKey::from_specification(environment, &spec) else {
            info!(
                event_type = %spec.event_type,
                "EventSpecification is incomplete, it will not be cached"
            );
            return;
        };

        match spec.specification.as_deref().filter(|s| !s.trim().is_empty()) {
            // Schema retracted: drop whatever was cached.
            None => {
                self.schemas.remove(&key);
            }
            Some(text) => match compile_schema(text) {
                Ok(validator) => {
                    self.schemas.insert(key, SchemaCacheEntry::valid(validator));
                }
                Err(e) => {
                    debug!(
                        event_type = %spec.event_type,
                        "Schema is not valid, caching negative entry: {e}"
                    );
                    self.schemas.insert(key, SchemaCacheEntry::invalid());
                }
            },
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_environment_polled(&self, environment: &str) -> bool {
        self.polled_environments.contains(environment)
    }
}

fn compile_schema(text: &str) -> Result<jsonschema::Validator, String> {
    let schema_json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| e.to_string())?;
    jsonschema::options()
        .build(&schema_json)
        .map_err(|e| e.to_string())
}
