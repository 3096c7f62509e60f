//! ValidationPipeline - ordered admission checks for a publish attempt
//!
//! Per attempt: realm check, event shape validation, payload-size check,
//! authorization check, schema check, then envelope construction and dispatch.
//! Checks run strictly in that order and the first failure aborts the rest,
//! so an unauthorized publisher never triggers a schema compile or validate.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use regex::Regex;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use eg_cache::{AuthorizationCache, SchemaCache, SchemaCacheEntry};
use eg_common::{Event, GatewayConfig, GatewayError, PublishedMessageEnvelope, Result};

use crate::gateway::PublishGateway;
use crate::{METRIC_SCHEMA_VALIDATION_FAILURE, METRIC_SCHEMA_VALIDATION_SUCCESS};

pub struct ValidationPipeline {
    config: GatewayConfig,
    header_blacklist: Vec<Regex>,
    authorization: Arc<AuthorizationCache>,
    schemas: Arc<SchemaCache>,
    gateway: PublishGateway,
}

impl ValidationPipeline {
    pub fn new(
        config: GatewayConfig,
        authorization: Arc<AuthorizationCache>,
        schemas: Arc<SchemaCache>,
        gateway: PublishGateway,
    ) -> Self {
        let header_blacklist = config.compiled_header_blacklist();
        Self {
            config,
            header_blacklist,
            authorization,
            schemas,
            gateway,
        }
    }

    /// Runs the full admission pipeline for one publish attempt and, if every
    /// check passes, dispatches the envelope to the broker.
    pub async fn publish(
        &self,
        event: Event,
        publisher_id: &str,
        realm: &str,
        environment: &str,
        http_headers: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let span = info_span!(
            "publish_event",
            event_type = %event.event_type,
            event_id = %event.id,
            isValidEventType = field::Empty,
            isValidPublisher = field::Empty,
            isValidEvent = field::Empty,
            isMatchingSchema = field::Empty,
            matchesPayloadPolicy = field::Empty,
        );

        self.run_checks(event, publisher_id, realm, environment, http_headers)
            .instrument(span)
            .await
    }

    async fn run_checks(
        &self,
        mut event: Event,
        publisher_id: &str,
        realm: &str,
        environment: &str,
        http_headers: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        self.check_realm(realm, environment)?;
        self.validate_event_shape(&event)?;
        self.check_payload_size(&event)?;

        if self.config.enable_publisher_check {
            self.check_event_type_ownership(environment, &event.event_type, publisher_id)?;
        }

        if self.config.enable_schema_validation {
            self.validate_against_schema(&event, environment, publisher_id)
                .await?;
        }

        event.stamp_time_if_absent(Utc::now());

        let mut envelope = PublishedMessageEnvelope::new(event, environment);
        envelope.http_headers = self.filter_http_headers(http_headers);
        envelope.attach_trusted_timestamp(Utc::now());

        self.gateway
            .send(&self.config.publishing_topic, &envelope)
            .await
    }

    /// The caller's authenticated realm must equal the canonicalized
    /// environment name.
    fn check_realm(&self, realm: &str, environment: &str) -> Result<()> {
        let environment = self.config.canonical_environment(environment);
        if realm != environment {
            return Err(GatewayError::RealmMismatch {
                realm: realm.to_string(),
                environment: environment.to_string(),
            });
        }
        Ok(())
    }

    /// Structural validation collecting every violation, not just the first.
    fn validate_event_shape(&self, event: &Event) -> Result<()> {
        let violations = event.violations();
        if !violations.is_empty() {
            Span::current().record("isValidEvent", "false");
            return Err(GatewayError::invalid_body(violations));
        }
        Span::current().record("isValidEvent", "true");
        Ok(())
    }

    fn check_payload_size(&self, event: &Event) -> Result<()> {
        if self
            .config
            .payload_check_exemption_list
            .iter()
            .any(|t| t == &event.event_type)
        {
            Span::current().record("matchesPayloadPolicy", "N/A");
            return Ok(());
        }

        let payload = serde_json::to_string(&event.data).map_err(|_| {
            GatewayError::invalid_body(vec!["Could not serialize event payload".to_string()])
        })?;

        if payload.len() > self.config.default_max_payload_size {
            Span::current().record("matchesPayloadPolicy", "false");
            return Err(GatewayError::PayloadTooLarge);
        }

        Span::current().record("matchesPayloadPolicy", "true");
        Ok(())
    }

    fn check_event_type_ownership(
        &self,
        environment: &str,
        event_type: &str,
        publisher_id: &str,
    ) -> Result<()> {
        let publisher_ids = self.authorization.lookup(environment, event_type);

        if publisher_ids.is_empty() {
            Span::current().record("isValidEventType", "false");
            return Err(GatewayError::UnknownTypeOrNoSubscription {
                event_type: event_type.to_string(),
            });
        }

        if publisher_id.trim().is_empty() || !publisher_ids.contains(publisher_id) {
            Span::current().record("isValidPublisher", "false");
            return Err(GatewayError::PublisherMismatch {
                publisher_id: publisher_id.to_string(),
            });
        }

        Span::current().record("isValidEventType", "true");
        Span::current().record("isValidPublisher", "true");
        Ok(())
    }

    /// Schema check. A publisher id that does not follow the
    /// hub--team--application convention skips this check entirely: no schema
    /// can be clearly assigned (internal system publishers). A registered,
    /// valid schema plus a payload that fails validation is hard only when
    /// enforcement is configured; a payload that is not valid JSON is always
    /// hard.
    async fn validate_against_schema(
        &self,
        event: &Event,
        environment: &str,
        publisher_id: &str,
    ) -> Result<()> {
        let Some((hub, team)) = split_publisher_id(publisher_id) else {
            info!(
                publisher_id = %publisher_id,
                "No schema can be clearly assigned to publisher id, skipping schema validation"
            );
            return Ok(());
        };

        let entry = self
            .schemas
            .schema_for_event_type(environment, &event.event_type, hub, team)
            .await;

        let schema = match entry {
            Some(SchemaCacheEntry {
                is_valid: true,
                schema: Some(schema),
            }) => schema,
            // Negative entry: the registered schema itself is broken, nothing
            // to validate against.
            Some(_) => return Ok(()),
            None => {
                debug!(
                    event_type = %event.event_type,
                    environment = %environment,
                    "No specification found, skipping schema validation"
                );
                return Ok(());
            }
        };

        if !is_json_content_type(event.datacontenttype.as_deref()) {
            return Ok(());
        }

        let payload = payload_as_json(event).ok_or_else(|| {
            info!(event_type = %event.event_type, "Event payload is no valid JSON");
            GatewayError::NotCompliantWithSchema {
                message: format!("Event of type {} is no valid JSON", event.event_type),
            }
        })?;

        match schema.validate(&payload) {
            Ok(()) => {
                Span::current().record("isMatchingSchema", "true");
                counter!(
                    METRIC_SCHEMA_VALIDATION_SUCCESS,
                    "event_type" => event.event_type.clone(),
                    "publisher_id" => publisher_id.to_string(),
                )
                .increment(1);
                Ok(())
            }
            Err(e) => {
                Span::current().record("isMatchingSchema", "false");
                info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Event does not comply with the registered schema"
                );
                counter!(
                    METRIC_SCHEMA_VALIDATION_FAILURE,
                    "event_type" => event.event_type.clone(),
                    "publisher_id" => publisher_id.to_string(),
                )
                .increment(1);

                if !self.config.enforce_schema_validation {
                    warn!(
                        event_type = %event.event_type,
                        event_id = %event.id,
                        "Schema validation is not enforced, skipping compliance check"
                    );
                    return Ok(());
                }

                Err(GatewayError::NotCompliantWithSchema {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Drops blacklisted headers and deduplicates values per header,
    /// preserving first-seen order.
    fn filter_http_headers(
        &self,
        http_headers: &HashMap<String, Vec<String>>,
    ) -> HashMap<String, Vec<String>> {
        let mut filtered = HashMap::new();

        for (name, values) in http_headers {
            let lowered = name.to_lowercase();
            if self.header_blacklist.iter().any(|p| p.is_match(&lowered)) {
                continue;
            }

            let mut unique = Vec::new();
            for value in values {
                if !unique.contains(value) {
                    unique.push(value.clone());
                }
            }
            filtered.insert(name.clone(), unique);
        }

        filtered
    }
}

/// Splits a hub--team--application publisher id into (hub, team). `None`
/// when the id has fewer than two segments or a blank hub/team segment.
fn split_publisher_id(publisher_id: &str) -> Option<(&str, &str)> {
    if publisher_id.trim().is_empty() {
        return None;
    }

    let mut segments = publisher_id.split("--");
    let hub = segments.next()?;
    let team = segments.next()?;
    if hub.trim().is_empty() || team.trim().is_empty() {
        return None;
    }
    Some((hub, team))
}

/// The configured content type must be JSON for schema validation to apply;
/// absent means JSON.
fn is_json_content_type(datacontenttype: Option<&str>) -> bool {
    let Some(content_type) = datacontenttype else {
        return true;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    matches!(essence.as_str(), "application/json" | "application/*" | "*/*")
        || essence.ends_with("+json")
}

/// Interprets the event payload as a JSON document. Strings are parsed as
/// embedded JSON text; the result must be an object or an array.
fn payload_as_json(event: &Event) -> Option<serde_json::Value> {
    let data = event.data.as_ref()?;

    let value = match data {
        serde_json::Value::String(text) => serde_json::from_str(text).ok()?,
        other => other.clone(),
    };

    match value {
        serde_json::Value::Object(_) | serde_json::Value::Array(_) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_id_splits_into_hub_and_team() {
        assert_eq!(split_publisher_id("hub--team--app"), Some(("hub", "team")));
        assert_eq!(split_publisher_id("hub--team"), Some(("hub", "team")));
        assert_eq!(split_publisher_id("hub"), None);
        assert_eq!(split_publisher_id("--team--app"), None);
        assert_eq!(split_publisher_id("hub----app"), None);
        assert_eq!(split_publisher_id(""), None);
    }

    #[test]
    fn json_content_types() {
        assert!(is_json_content_type(None));
        assert!(is_json_content_type(Some("application/json")));
        assert!(is_json_content_type(Some("application/json; charset=utf-8")));
        assert!(is_json_content_type(Some("application/cloudevents+json")));
        assert!(!is_json_content_type(Some("text/plain")));
        assert!(!is_json_content_type(Some("application/xml")));
    }

    #[test]
    fn payload_forms() {
        let mut event = Event {
            id: "id".to_string(),
            event_type: "t".to_string(),
            source: "s".to_string(),
            specversion: "1.0".to_string(),
            time: None,
            datacontenttype: None,
            data: Some(serde_json::json!({"foo": "bar"})),
        };
        assert!(payload_as_json(&event).is_some());

        event.data = Some(serde_json::json!([1, 2, 3]));
        assert!(payload_as_json(&event).is_some());

        // Embedded JSON text parses to a document.
        event.data = Some(serde_json::Value::String("{\"foo\": 1}".to_string()));
        assert_eq!(
            payload_as_json(&event),
            Some(serde_json::json!({"foo": 1}))
        );
        event.data = Some(serde_json::Value::String("[1, 2]".to_string()));
        assert!(payload_as_json(&event).is_some());

        // Scalars and broken text are not valid documents.
        event.data = Some(serde_json::Value::String("not json".to_string()));
        assert!(payload_as_json(&event).is_none());
        event.data = Some(serde_json::json!(42));
        assert!(payload_as_json(&event).is_none());
        event.data = None;
        assert!(payload_as_json(&event).is_none());
    }
}
