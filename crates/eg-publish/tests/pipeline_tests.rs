//! End-to-end admission pipeline tests
//!
//! Wires the pipeline against an in-memory broker and specification registry
//! and exercises check ordering, authorization outcomes, payload policy and
//! schema enforcement modes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use eg_cache::{
    AuthorizationCache, EventSpecification, RegistryError, SchemaCache, SpecificationRegistry,
};
use eg_common::{Event, GatewayConfig, GatewayError, PublishedMessageEnvelope, Status};
use eg_publish::{BrokerClient, BrokerError, PublishGateway, ValidationPipeline};

const EVENT_TYPE: &str = "orders.created.v1";
const PUBLISHER_ID: &str = "hub--team--app";

const REQUIRES_FOO: &str = r#"{
    "type": "object",
    "properties": {
        "foo": { "type": "string" }
    },
    "required": ["foo"]
}"#;

struct RecordingBroker {
    sent: parking_lot::Mutex<Vec<(String, PublishedMessageEnvelope)>>,
}

impl RecordingBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn last_envelope(&self) -> Option<(String, PublishedMessageEnvelope)> {
        self.sent.lock().last().cloned()
    }
}

#[async_trait]
impl BrokerClient for RecordingBroker {
    async fn send(
        &self,
        topic: &str,
        envelope: &PublishedMessageEnvelope,
    ) -> Result<(), BrokerError> {
        self.sent.lock().push((topic.to_string(), envelope.clone()));
        Ok(())
    }
}

struct StubRegistry {
    specifications: Vec<EventSpecification>,
    fetches: AtomicUsize,
}

impl StubRegistry {
    fn with_schema(schema: &str) -> Arc<Self> {
        Arc::new(Self {
            specifications: vec![EventSpecification {
                event_type: EVENT_TYPE.to_string(),
                hub: Some("hub".to_string()),
                team: Some("team".to_string()),
                specification: Some(schema.to_string()),
            }],
            fetches: AtomicUsize::new(0),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self {
            specifications: Vec::new(),
            fetches: AtomicUsize::new(0),
        })
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpecificationRegistry for StubRegistry {
    async fn fetch_all_specifications(
        &self,
        _environment: &str,
    ) -> Result<Vec<EventSpecification>, RegistryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.specifications.clone())
    }
}

struct Harness {
    pipeline: ValidationPipeline,
    broker: Arc<RecordingBroker>,
    registry: Arc<StubRegistry>,
    authorization: Arc<AuthorizationCache>,
}

fn harness(config: GatewayConfig, registry: Arc<StubRegistry>) -> Harness {
    let broker = RecordingBroker::new();
    let authorization = Arc::new(AuthorizationCache::new());
    let schemas = Arc::new(SchemaCache::new(registry.clone(), Duration::from_secs(5)));
    let gateway = PublishGateway::new(broker.clone());
    let pipeline = ValidationPipeline::new(config, authorization.clone(), schemas, gateway);

    Harness {
        pipeline,
        broker,
        registry,
        authorization,
    }
}

fn authorized_harness(config: GatewayConfig, registry: Arc<StubRegistry>) -> Harness {
    let h = harness(config, registry);
    h.authorization.upsert(
        "test",
        EVENT_TYPE,
        "sub-1",
        HashSet::from([PUBLISHER_ID.to_string()]),
    );
    h
}

fn event_with_data(data: serde_json::Value) -> Event {
    Event {
        id: uuid::Uuid::new_v4().to_string(),
        event_type: EVENT_TYPE.to_string(),
        source: "https://orders.example.com".to_string(),
        specversion: "1.0".to_string(),
        time: None,
        datacontenttype: Some("application/json".to_string()),
        data: Some(data),
    }
}

async fn publish(h: &Harness, event: Event, publisher_id: &str) -> eg_common::Result<()> {
    h.pipeline
        .publish(event, publisher_id, "test", "test", &HashMap::new())
        .await
}

#[tokio::test]
async fn accepted_event_reaches_the_broker_as_processed() {
    let h = authorized_harness(GatewayConfig::default(), StubRegistry::with_schema(REQUIRES_FOO));

    let headers = HashMap::from([
        (
            "x-correlation-id".to_string(),
            vec!["abc".to_string(), "abc".to_string(), "def".to_string()],
        ),
        ("authorization".to_string(), vec!["Bearer secret".to_string()]),
    ]);

    let event = event_with_data(serde_json::json!({"foo": "bar"}));
    h.pipeline
        .publish(event, PUBLISHER_ID, "test", "test", &headers)
        .await
        .expect("pipeline reaches dispatch");

    let (topic, envelope) = h.broker.last_envelope().expect("broker invoked");
    assert_eq!(topic, "published");
    assert_eq!(envelope.status, Status::Processed);
    assert_eq!(envelope.environment, "test");
    // Time was stamped, the trusted timestamp attached, headers filtered and
    // values deduplicated.
    assert!(envelope.event.time.is_some());
    assert!(envelope.additional_fields.contains_key("startTimeTrusted"));
    assert!(!envelope.http_headers.contains_key("authorization"));
    assert_eq!(
        envelope.http_headers.get("x-correlation-id"),
        Some(&vec!["abc".to_string(), "def".to_string()])
    );
}

#[tokio::test]
async fn unknown_event_type_never_reaches_the_broker() {
    let h = harness(GatewayConfig::default(), StubRegistry::empty());

    let err = publish(&h, event_with_data(serde_json::json!({"foo": "bar"})), PUBLISHER_ID)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::UnknownTypeOrNoSubscription { .. }));
    assert!(err.is_soft());
    assert_eq!(h.broker.sent_count(), 0);
}

#[tokio::test]
async fn foreign_publisher_is_rejected() {
    let h = harness(GatewayConfig::default(), StubRegistry::empty());
    h.authorization.upsert(
        "test",
        EVENT_TYPE,
        "sub-1",
        HashSet::from(["valid--pub".to_string()]),
    );

    let err = publish(&h, event_with_data(serde_json::json!({})), "other--pub")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::PublisherMismatch { .. }));
    assert_eq!(h.broker.sent_count(), 0);
}

#[tokio::test]
async fn blank_publisher_id_is_a_mismatch_not_a_schema_skip() {
    let h = authorized_harness(GatewayConfig::default(), StubRegistry::empty());

    let err = publish(&h, event_with_data(serde_json::json!({})), "")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::PublisherMismatch { .. }));
}

#[tokio::test]
async fn authorization_failure_short_circuits_the_schema_check() {
    // The event would also fail schema validation, but the pipeline must
    // never consult the registry for an unauthorized publisher.
    let config = GatewayConfig {
        enforce_schema_validation: true,
        ..Default::default()
    };
    let h = harness(config, StubRegistry::with_schema(REQUIRES_FOO));

    let err = publish(&h, event_with_data(serde_json::json!({"bar": "baz"})), PUBLISHER_ID)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::UnknownTypeOrNoSubscription { .. }));
    assert_eq!(h.registry.fetch_count(), 0);
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let config = GatewayConfig {
        default_max_payload_size: 16,
        ..Default::default()
    };
    let h = authorized_harness(config, StubRegistry::empty());

    let big = "x".repeat(64);
    let err = publish(&h, event_with_data(serde_json::json!({ "blob": big })), PUBLISHER_ID)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::PayloadTooLarge));
    assert_eq!(h.broker.sent_count(), 0);
}

#[tokio::test]
async fn exempted_event_type_bypasses_the_size_check() {
    let config = GatewayConfig {
        default_max_payload_size: 16,
        payload_check_exemption_list: vec![EVENT_TYPE.to_string()],
        ..Default::default()
    };
    let h = authorized_harness(config, StubRegistry::empty());

    let big = "x".repeat(64);
    publish(&h, event_with_data(serde_json::json!({ "blob": big })), PUBLISHER_ID)
        .await
        .expect("exempted type is accepted despite its size");

    assert_eq!(h.broker.sent_count(), 1);
}

#[tokio::test]
async fn realm_mismatch_fails_before_anything_else() {
    let h = harness(GatewayConfig::default(), StubRegistry::empty());

    let err = h
        .pipeline
        .publish(
            event_with_data(serde_json::json!({})),
            PUBLISHER_ID,
            "other-realm",
            "test",
            &HashMap::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::RealmMismatch { .. }));
}

#[tokio::test]
async fn default_environment_canonicalizes_for_the_realm_check() {
    let config = GatewayConfig {
        default_environment: "integration".to_string(),
        ..Default::default()
    };
    let h = harness(config, StubRegistry::empty());
    h.authorization.upsert(
        "integration",
        EVENT_TYPE,
        "sub-1",
        HashSet::from([PUBLISHER_ID.to_string()]),
    );

    // Realm "default" is what tokens in the default environment carry.
    h.pipeline
        .publish(
            event_with_data(serde_json::json!({})),
            PUBLISHER_ID,
            "default",
            "integration",
            &HashMap::new(),
        )
        .await
        .expect("canonicalized environment matches the realm");
}

#[tokio::test]
async fn shape_violations_are_reported_together() {
    let h = authorized_harness(GatewayConfig::default(), StubRegistry::empty());

    let event = Event {
        id: String::new(),
        event_type: EVENT_TYPE.to_string(),
        source: String::new(),
        specversion: "1.0".to_string(),
        time: None,
        datacontenttype: None,
        data: None,
    };

    match publish(&h, event, PUBLISHER_ID).await.unwrap_err() {
        GatewayError::InvalidEventBody { violations } => {
            assert_eq!(violations.len(), 2);
        }
        other => panic!("expected InvalidEventBody, got {other:?}"),
    }
}

#[tokio::test]
async fn schema_violation_is_hard_when_enforced() {
    let config = GatewayConfig {
        enforce_schema_validation: true,
        ..Default::default()
    };
    let h = authorized_harness(config, StubRegistry::with_schema(REQUIRES_FOO));

    let err = publish(&h, event_with_data(serde_json::json!({"bar": "baz"})), PUBLISHER_ID)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::NotCompliantWithSchema { .. }));
    assert_eq!(h.broker.sent_count(), 0);
}

#[tokio::test]
async fn schema_violation_fails_open_when_not_enforced() {
    let config = GatewayConfig {
        enforce_schema_validation: false,
        ..Default::default()
    };
    let h = authorized_harness(config, StubRegistry::with_schema(REQUIRES_FOO));

    publish(&h, event_with_data(serde_json::json!({"bar": "baz"})), PUBLISHER_ID)
        .await
        .expect("non-enforced schema violation passes through");

    assert_eq!(h.broker.sent_count(), 1);
}

#[tokio::test]
async fn unparseable_payload_is_hard_even_without_enforcement() {
    let config = GatewayConfig {
        enforce_schema_validation: false,
        ..Default::default()
    };
    let h = authorized_harness(config, StubRegistry::with_schema(REQUIRES_FOO));

    let event = event_with_data(serde_json::Value::String("not json".to_string()));
    let err = publish(&h, event, PUBLISHER_ID).await.unwrap_err();

    assert!(matches!(err, GatewayError::NotCompliantWithSchema { .. }));
}

#[tokio::test]
async fn malformed_publisher_id_skips_only_the_schema_check() {
    let config = GatewayConfig {
        enforce_schema_validation: true,
        ..Default::default()
    };
    let h = harness(config, StubRegistry::with_schema(REQUIRES_FOO));
    // An internal system publisher whose id does not follow the
    // hub--team--application convention.
    h.authorization.upsert(
        "test",
        EVENT_TYPE,
        "sub-1",
        HashSet::from(["internalclient".to_string()]),
    );

    // Payload would violate the schema, but no schema can be assigned.
    publish(&h, event_with_data(serde_json::json!({"bar": "baz"})), "internalclient")
        .await
        .expect("schema check skipped for malformed publisher id");

    assert_eq!(h.registry.fetch_count(), 0);
    assert_eq!(h.broker.sent_count(), 1);
}

#[tokio::test]
async fn non_json_content_type_skips_schema_validation() {
    let config = GatewayConfig {
        enforce_schema_validation: true,
        ..Default::default()
    };
    let h = authorized_harness(config, StubRegistry::with_schema(REQUIRES_FOO));

    let mut event = event_with_data(serde_json::json!({"bar": "baz"}));
    event.datacontenttype = Some("application/xml".to_string());

    publish(&h, event, PUBLISHER_ID)
        .await
        .expect("non-JSON payloads are not schema validated");
}

#[tokio::test]
async fn disabled_publisher_check_skips_authorization() {
    let config = GatewayConfig {
        enable_publisher_check: false,
        enable_schema_validation: false,
        ..Default::default()
    };
    let h = harness(config, StubRegistry::empty());

    publish(&h, event_with_data(serde_json::json!({})), PUBLISHER_ID)
        .await
        .expect("no authorization entry needed when the check is disabled");

    assert_eq!(h.broker.sent_count(), 1);
    assert_eq!(h.registry.fetch_count(), 0);
}
