use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ============================================================================
// Core Event Types
// ============================================================================

/// An inbound event as submitted by a publisher.
///
/// Field names follow the CloudEvents attribute spelling on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub specversion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Collects all structural violations instead of stopping at the first,
    /// so callers can report the complete list in one response.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.id.trim().is_empty() {
            violations.push("id must not be empty".to_string());
        } else if uuid::Uuid::parse_str(&self.id).is_err() {
            violations.push("id must be a valid UUID".to_string());
        }

        if self.event_type.trim().is_empty() {
            violations.push("type must not be empty".to_string());
        }

        if self.source.trim().is_empty() {
            violations.push("source must not be empty".to_string());
        }

        if self.specversion.trim().is_empty() {
            violations.push("specversion must not be empty".to_string());
        } else if self.specversion != "1.0" {
            violations.push(format!("specversion {} is not supported", self.specversion));
        }

        if let Some(time) = &self.time {
            if DateTime::parse_from_rfc3339(time).is_err() {
                violations.push("time must be a valid RFC 3339 timestamp".to_string());
            }
        }

        violations
    }

    /// Stamps the time field with `now` when the publisher left it unset.
    pub fn stamp_time_if_absent(&mut self, now: DateTime<Utc>) {
        if self.time.is_none() {
            self.time = Some(now.to_rfc3339());
        }
    }
}

/// Processing status carried on an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "PROCESSED")]
    Processed,
}

/// Additional-fields key for the trusted send timestamp (epoch milliseconds).
pub const START_TIME_TRUSTED: &str = "startTimeTrusted";

/// The message written to the broker topic for an accepted publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedMessageEnvelope {
    pub uuid: String,
    pub event: Event,
    pub environment: String,
    pub status: Status,
    pub http_headers: HashMap<String, Vec<String>>,
    pub additional_fields: HashMap<String, serde_json::Value>,
}

impl PublishedMessageEnvelope {
    pub fn new(event: Event, environment: impl Into<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            event,
            environment: environment.into(),
            status: Status::Processed,
            http_headers: HashMap::new(),
            additional_fields: HashMap::new(),
        }
    }

    /// Attaches the trusted send timestamp. Set exactly once per publish
    /// attempt, immediately before dispatch.
    pub fn attach_trusted_timestamp(&mut self, now: DateTime<Utc>) {
        self.additional_fields.insert(
            START_TIME_TRUSTED.to_string(),
            serde_json::Value::from(now.timestamp_millis()),
        );
    }
}

// ============================================================================
// Subscription Notifications
// ============================================================================

/// Payload of a subscription resource-lifecycle notification.
///
/// A subscription grants one or more publisher identities the right to emit
/// an event type in an environment; its lifecycle drives the authorization
/// cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub event_type: String,
    pub subscription_id: String,
    pub publisher_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_publisher_ids: Vec<String>,
}

impl SubscriptionNotification {
    /// All publisher ids granted by this subscription, lowercased.
    pub fn all_publisher_ids(&self) -> std::collections::HashSet<String> {
        self.additional_publisher_ids
            .iter()
            .chain(std::iter::once(&self.publisher_id))
            .map(|id| id.to_lowercase())
            .collect()
    }
}

/// A resource-lifecycle change delivered by the external watch mechanism.
#[derive(Debug, Clone)]
pub enum SubscriptionChange {
    Added(SubscriptionNotification),
    Updated(SubscriptionNotification),
    Deleted(SubscriptionNotification),
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub enable_publisher_check: bool,
    pub enable_schema_validation: bool,
    pub enforce_schema_validation: bool,
    pub default_environment: String,
    pub publishing_topic: String,
    pub default_max_payload_size: usize,
    pub payload_check_exemption_list: Vec<String>,
    pub header_propagation_blacklist: Vec<String>,
    pub schema_poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enable_publisher_check: true,
            enable_schema_validation: true,
            enforce_schema_validation: false,
            default_environment: "integration".to_string(),
            publishing_topic: "published".to_string(),
            default_max_payload_size: 1_048_576,
            payload_check_exemption_list: Vec::new(),
            header_propagation_blacklist: vec![
                "^authorization$".to_string(),
                "^cookie$".to_string(),
                "^x-forwarded-.*".to_string(),
            ],
            schema_poll_interval: Duration::from_secs(300),
        }
    }
}

impl GatewayConfig {
    /// Canonicalizes an environment name: the configured default environment
    /// maps to the literal "default".
    pub fn canonical_environment<'a>(&self, environment: &'a str) -> &'a str {
        if environment == self.default_environment {
            "default"
        } else {
            environment
        }
    }

    /// Compiles the header blacklist patterns once. Patterns are matched
    /// against the full header name. Invalid patterns are skipped with a
    /// warning rather than refusing to start.
    pub fn compiled_header_blacklist(&self) -> Vec<Regex> {
        self.header_propagation_blacklist
            .iter()
            .filter_map(|pattern| {
                let anchored = format!("^(?:{pattern})$");
                match Regex::new(&anchored) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern = %pattern, "Skipping invalid header blacklist pattern: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Admission failure taxonomy. Every check failure aborts the pipeline
/// immediately; `CouldNotPublish` is the only kind callers should retry on.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Realm '{realm}' does not match environment '{environment}'")]
    RealmMismatch { realm: String, environment: String },

    #[error("Invalid event body: {}", violations.join("; "))]
    InvalidEventBody { violations: Vec<String> },

    #[error("The event type {event_type} could not be found. It either has not been exposed yet or there are no subscribers")]
    UnknownTypeOrNoSubscription { event_type: String },

    #[error("The event type does not belong to publisher with id '{publisher_id}'")]
    PublisherMismatch { publisher_id: String },

    #[error("Event is not compliant with the registered schema: {message}")]
    NotCompliantWithSchema { message: String },

    #[error("The payload is too large to be published")]
    PayloadTooLarge,

    #[error("Failed to publish event: {message}")]
    CouldNotPublish { message: String },
}

impl GatewayError {
    pub fn invalid_body(violations: Vec<String>) -> Self {
        Self::InvalidEventBody { violations }
    }

    pub fn could_not_publish(message: impl Into<String>) -> Self {
        Self::CouldNotPublish { message: message.into() }
    }

    /// True for the accepted-but-not-delivered outcome, which is expected
    /// traffic rather than a server fault.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::UnknownTypeOrNoSubscription { .. })
    }

    /// True only for possibly-transient downstream faults.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CouldNotPublish { .. })
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_event() -> Event {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: "orders.created.v1".to_string(),
            source: "https://orders.example.com".to_string(),
            specversion: "1.0".to_string(),
            time: None,
            datacontenttype: Some("application/json".to_string()),
            data: Some(serde_json::json!({"foo": "bar"})),
        }
    }

    #[test]
    fn valid_event_has_no_violations() {
        assert!(valid_event().violations().is_empty());
    }

    #[test]
    fn violations_are_collected_not_short_circuited() {
        let event = Event {
            id: String::new(),
            event_type: String::new(),
            source: String::new(),
            specversion: "2.0".to_string(),
            time: Some("not-a-timestamp".to_string()),
            datacontenttype: None,
            data: None,
        };

        let violations = event.violations();
        assert_eq!(violations.len(), 5);
    }

    #[test]
    fn stamp_time_only_when_absent() {
        let now = Utc::now();

        let mut event = valid_event();
        event.stamp_time_if_absent(now);
        assert_eq!(event.time, Some(now.to_rfc3339()));

        let mut stamped = valid_event();
        stamped.time = Some("2024-01-01T00:00:00Z".to_string());
        stamped.stamp_time_if_absent(now);
        assert_eq!(stamped.time, Some("2024-01-01T00:00:00Z".to_string()));
    }

    #[test]
    fn canonical_environment_maps_default() {
        let config = GatewayConfig {
            default_environment: "integration".to_string(),
            ..Default::default()
        };
        assert_eq!(config.canonical_environment("integration"), "default");
        assert_eq!(config.canonical_environment("test"), "test");
    }

    #[test]
    fn header_blacklist_requires_full_match() {
        let config = GatewayConfig {
            header_propagation_blacklist: vec!["x-forwarded-.*".to_string()],
            ..Default::default()
        };
        let compiled = config.compiled_header_blacklist();
        assert_eq!(compiled.len(), 1);
        assert!(compiled[0].is_match("x-forwarded-for"));
        assert!(!compiled[0].is_match("my-x-forwarded-for"));
    }

    #[test]
    fn subscription_publisher_ids_are_lowercased_and_merged() {
        let notification = SubscriptionNotification {
            environment: None,
            event_type: "orders.created.v1".to_string(),
            subscription_id: "sub-1".to_string(),
            publisher_id: "Hub--Team--App".to_string(),
            additional_publisher_ids: vec!["other--pub--app".to_string()],
        };

        let ids = notification.all_publisher_ids();
        assert!(ids.contains("hub--team--app"));
        assert!(ids.contains("other--pub--app"));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn trusted_timestamp_is_epoch_millis() {
        let now = Utc::now();
        let mut envelope = PublishedMessageEnvelope::new(valid_event(), "test");
        envelope.attach_trusted_timestamp(now);

        assert_eq!(
            envelope.additional_fields.get(START_TIME_TRUSTED),
            Some(&serde_json::Value::from(now.timestamp_millis()))
        );
    }

    #[test]
    fn only_could_not_publish_is_retryable() {
        assert!(GatewayError::could_not_publish("broker down").is_retryable());
        assert!(!GatewayError::PayloadTooLarge.is_retryable());
        let soft = GatewayError::UnknownTypeOrNoSubscription {
            event_type: "orders.created.v1".to_string(),
        };
        assert!(soft.is_soft());
        assert!(!soft.is_retryable());
    }
}
