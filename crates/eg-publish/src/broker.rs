//! Broker client seam
//!
//! The gateway only needs one operation from the broker: write an envelope to
//! a topic and wait for the acknowledgment. The trait keeps the pipeline
//! testable; the AMQP implementation is the production client.

use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use eg_common::PublishedMessageEnvelope;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Record too large for the broker")]
    RecordTooLarge,

    #[error("Broker did not acknowledge in time")]
    Timeout,

    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker error: {0}")]
    Other(String),
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::IOError(_) => BrokerError::Connection(e.to_string()),
            lapin::Error::InvalidConnectionState(_) => BrokerError::Connection(e.to_string()),
            _ => BrokerError::Other(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Other(format!("Envelope serialization failed: {e}"))
    }
}

/// Seam to the external broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        envelope: &PublishedMessageEnvelope,
    ) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
pub struct AmqpBrokerConfig {
    pub uri: String,
    pub exchange: String,
    /// Messages larger than this are rejected client-side before dispatch,
    /// the same way a Kafka client rejects records above max.request.size.
    pub max_message_size: usize,
    pub confirm_timeout: Duration,
}

impl Default for AmqpBrokerConfig {
    fn default() -> Self {
        Self {
            uri: "amqp://127.0.0.1:5672/%2f".to_string(),
            exchange: "".to_string(),
            max_message_size: 4 * 1_048_576,
            confirm_timeout: Duration::from_secs(10),
        }
    }
}

/// AMQP broker client with publisher confirms.
pub struct AmqpBrokerClient {
    channel: Channel,
    config: AmqpBrokerConfig,
}

impl AmqpBrokerClient {
    pub async fn connect(config: AmqpBrokerConfig) -> Result<Self, BrokerError> {
        let connection =
            Connection::connect(&config.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!(exchange = %config.exchange, "Connected to broker");
        Ok(Self { channel, config })
    }
}

#[async_trait]
impl BrokerClient for AmqpBrokerClient {
    async fn send(
        &self,
        topic: &str,
        envelope: &PublishedMessageEnvelope,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(envelope)?;
        if payload.len() > self.config.max_message_size {
            return Err(BrokerError::RecordTooLarge);
        }

        let publish = async {
            let confirm = self
                .channel
                .basic_publish(
                    &self.config.exchange,
                    topic,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default().with_content_type("application/json".into()),
                )
                .await?
                .await?;

            if confirm.is_nack() {
                return Err(BrokerError::Other("Broker nacked the message".to_string()));
            }
            Ok(())
        };

        match tokio::time::timeout(self.config.confirm_timeout, publish).await {
            Ok(result) => {
                if result.is_ok() {
                    debug!(topic = %topic, uuid = %envelope.uuid, "Message acknowledged");
                }
                result
            }
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}
