//! EventGate admission gateway
//!
//! Wires the admission pipeline together: authorization cache fed by
//! subscription notifications, schema cache polling the specification
//! registry, validation pipeline, and the AMQP broker client. Exposes
//! /health and /metrics; the publish transport and the resource-watch
//! transport attach to the pipeline and the notification channel.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use eg_cache::{
    AuthorizationCache, HttpRegistryConfig, HttpSpecificationRegistry, SchemaCache,
    SchemaRefreshConfig, SchemaRefreshTask, SubscriptionWatcher,
};
use eg_common::{GatewayConfig, SubscriptionChange};
use eg_publish::{AmqpBrokerClient, AmqpBrokerConfig, PublishGateway, ValidationPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting EventGate admission gateway");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let config = gateway_config_from_env();

    // Schema cache and its registry poller
    let registry = Arc::new(
        HttpSpecificationRegistry::new(HttpRegistryConfig {
            base_url: env_or("EVENTGATE_REGISTRY_URL", "http://localhost:8080"),
            ..Default::default()
        })
        .context("Failed to build registry client")?,
    );
    let schemas = Arc::new(SchemaCache::new(registry, Duration::from_secs(10)));
    let refresh = SchemaRefreshTask::new(
        schemas.clone(),
        SchemaRefreshConfig {
            interval: config.schema_poll_interval,
            enable_schema_validation: config.enable_schema_validation,
        },
    );
    let refresh_handle = refresh.start();

    // Authorization cache fed by the subscription watch channel
    let authorization = Arc::new(AuthorizationCache::new());
    let (subscription_tx, subscription_rx) = mpsc::channel::<SubscriptionChange>(1024);
    let watcher = SubscriptionWatcher::new(authorization.clone(), config.default_environment.clone());
    let watcher_handle = tokio::spawn(watcher.run(subscription_rx));
    // The resource-watch transport publishes lifecycle notifications here.
    let _subscription_tx = subscription_tx;

    // Broker client and publish path
    let broker = Arc::new(
        AmqpBrokerClient::connect(AmqpBrokerConfig {
            uri: env_or("EVENTGATE_AMQP_URI", "amqp://127.0.0.1:5672/%2f"),
            exchange: env_or("EVENTGATE_AMQP_EXCHANGE", ""),
            ..Default::default()
        })
        .await
        .context("Failed to connect to broker")?,
    );
    let gateway = PublishGateway::new(broker);
    let pipeline = Arc::new(ValidationPipeline::new(
        config,
        authorization,
        schemas,
        gateway,
    ));
    // The publish transport calls pipeline.publish() per request.
    let _pipeline = pipeline;

    // Health and metrics surface
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(move || async move { prometheus.render() }));

    let addr = env_or("EVENTGATE_HTTP_ADDR", "0.0.0.0:9090");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Health/metrics server listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("Health server failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    refresh.shutdown();
    let _ = refresh_handle.await;
    watcher_handle.abort();

    info!("EventGate stopped");
    Ok(())
}

fn gateway_config_from_env() -> GatewayConfig {
    let defaults = GatewayConfig::default();

    GatewayConfig {
        enable_publisher_check: env_bool("EVENTGATE_ENABLE_PUBLISHER_CHECK", true),
        enable_schema_validation: env_bool("EVENTGATE_ENABLE_SCHEMA_VALIDATION", true),
        enforce_schema_validation: env_bool("EVENTGATE_ENFORCE_SCHEMA_VALIDATION", false),
        default_environment: env_or("EVENTGATE_DEFAULT_ENVIRONMENT", &defaults.default_environment),
        publishing_topic: env_or("EVENTGATE_PUBLISHING_TOPIC", &defaults.publishing_topic),
        default_max_payload_size: env_usize(
            "EVENTGATE_MAX_PAYLOAD_SIZE",
            defaults.default_max_payload_size,
        ),
        payload_check_exemption_list: env_csv("EVENTGATE_PAYLOAD_CHECK_EXEMPTIONS"),
        header_propagation_blacklist: {
            let patterns = env_csv("EVENTGATE_HEADER_BLACKLIST");
            if patterns.is_empty() {
                defaults.header_propagation_blacklist
            } else {
                patterns
            }
        },
        schema_poll_interval: Duration::from_secs(env_u64(
            "EVENTGATE_SCHEMA_POLL_INTERVAL_SECS",
            defaults.schema_poll_interval.as_secs(),
        )),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
