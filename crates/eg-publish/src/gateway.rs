//! PublishGateway - broker write with error mapping and publish metrics

use std::sync::Arc;

use metrics::counter;
use tracing::{debug_span, error, Instrument};

use eg_common::{GatewayError, PublishedMessageEnvelope, Result};

use crate::broker::{BrokerClient, BrokerError};
use crate::METRIC_PUBLISHED_EVENTS;

/// Wraps the external broker write: maps broker failures to gateway error
/// kinds and increments the publish counter exactly once per accepted event.
pub struct PublishGateway {
    broker: Arc<dyn BrokerClient>,
}

impl PublishGateway {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self { broker }
    }

    pub async fn send(&self, topic: &str, envelope: &PublishedMessageEnvelope) -> Result<()> {
        // The span guard closes on drop, on every exit path.
        let span = debug_span!(
            "publish message",
            event_type = %envelope.event.event_type,
            event_id = %envelope.event.id,
            environment = %envelope.environment,
        );

        async {
            match self.broker.send(topic, envelope).await {
                Ok(()) => {
                    counter!(
                        METRIC_PUBLISHED_EVENTS,
                        "event_type" => envelope.event.event_type.clone(),
                        "environment" => envelope.environment.clone(),
                    )
                    .increment(1);
                    Ok(())
                }
                Err(BrokerError::RecordTooLarge) => {
                    error!(event_id = %envelope.event.id, "Broker rejected record as too large");
                    Err(GatewayError::PayloadTooLarge)
                }
                Err(e) => {
                    error!(event_id = %envelope.event.id, "Failed to publish event: {e}");
                    Err(GatewayError::could_not_publish(e.to_string()))
                }
            }
        }
        .instrument(span)
        .await
    }
}
