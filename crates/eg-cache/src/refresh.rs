//! Periodic schema refresh task
//!
//! One background task re-polls every environment the schema cache has seen,
//! on a fixed period, independent of the request path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::schema::SchemaCache;

#[derive(Debug, Clone)]
pub struct SchemaRefreshConfig {
    pub interval: Duration,
    /// Mirrors the schema-validation feature flag: refreshing a cache nobody
    /// consults is pointless load on the registry.
    pub enable_schema_validation: bool,
}

impl Default for SchemaRefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            enable_schema_validation: true,
        }
    }
}

pub struct SchemaRefreshTask {
    cache: Arc<SchemaCache>,
    config: SchemaRefreshConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl SchemaRefreshTask {
    pub fn new(cache: Arc<SchemaCache>, config: SchemaRefreshConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            cache,
            config,
            shutdown_tx,
        }
    }

    /// Spawns the refresh loop. The first tick fires after one full interval.
    pub fn start(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !config.enable_schema_validation {
                            debug!("Schema validation disabled, skipping scheduled poll");
                            continue;
                        }
                        cache.refresh_polled_environments().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Schema refresh task shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
