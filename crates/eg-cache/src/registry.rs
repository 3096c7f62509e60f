//! Remote schema registry client
//!
//! The registry serves the full list of event specifications for an
//! environment. The trait is the seam the schema cache polls through; the
//! HTTP implementation uses bounded timeouts so a lookup-path poll can never
//! hang a request indefinitely.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single event specification as served by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSpecification {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Raw JSON schema text; absent or empty means the schema was retracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specification: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Registry returned status {status}")]
    Status { status: u16 },
}

/// Seam to the remote specification registry.
#[async_trait]
pub trait SpecificationRegistry: Send + Sync {
    async fn fetch_all_specifications(
        &self,
        environment: &str,
    ) -> Result<Vec<EventSpecification>, RegistryError>;
}

#[derive(Debug, Clone)]
pub struct HttpRegistryConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpRegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Listing-endpoint response wrapper.
#[derive(Debug, Deserialize)]
struct ItemsWrapper {
    #[serde(default)]
    items: Vec<EventSpecification>,
}

pub struct HttpSpecificationRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpecificationRegistry {
    pub fn new(config: HttpRegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SpecificationRegistry for HttpSpecificationRegistry {
    async fn fetch_all_specifications(
        &self,
        environment: &str,
    ) -> Result<Vec<EventSpecification>, RegistryError> {
        let url = format!(
            "{}/api/v1/environments/{}/event-specifications",
            self.base_url, environment
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                status: status.as_u16(),
            });
        }

        let wrapper: ItemsWrapper = response.json().await?;
        debug!(
            environment = %environment,
            count = wrapper.items.len(),
            "Polled event specifications"
        );
        Ok(wrapper.items)
    }
}
