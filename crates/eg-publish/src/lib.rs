//! EventGate publish path
//!
//! This crate provides the request-side of the gateway:
//! - ValidationPipeline: realm, event shape, payload size, authorization and
//!   schema checks in strict order, then envelope construction and dispatch
//! - PublishGateway: broker write with error-kind mapping, publish counter and
//!   a dispatch span that closes on every exit path
//! - BrokerClient: async seam to the broker, with an AMQP implementation

pub mod broker;
pub mod gateway;
pub mod pipeline;

pub use broker::{AmqpBrokerClient, AmqpBrokerConfig, BrokerClient, BrokerError};
pub use gateway::PublishGateway;
pub use pipeline::ValidationPipeline;

/// Counter incremented exactly once per accepted publish, labeled by event
/// type and environment.
pub const METRIC_PUBLISHED_EVENTS: &str = "eventgate_published_events_total";
pub const METRIC_SCHEMA_VALIDATION_SUCCESS: &str = "eventgate_schema_validation_success_total";
pub const METRIC_SCHEMA_VALIDATION_FAILURE: &str = "eventgate_schema_validation_failure_total";
