use super::{decode_json, send_with_policy, RequestPolicy};
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

/// Client for the satellite subscriptions API. Delivery payloads come back
/// as raw bytes; parsing them belongs to the subscription manager, not here.
pub struct SatelliteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RequestPolicy,
    biomass_product: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamSubscriptionState {
    Preparing,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEnvelope {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionStatusEnvelope {
    status: UpstreamSubscriptionState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryRef {
    pub id: String,
    /// Where the delivered CSV can be fetched from.
    pub location: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope {
    #[serde(default)]
    results: Vec<DeliveryRef>,
}

impl SatelliteClient {
    pub fn from_config(config: &ProcessorConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: config
                .planet_subscriptions_url
                .trim_end_matches('/')
                .to_string(),
            api_key: config.planet_api_key.clone(),
            policy: RequestPolicy::new(3, config.planet_timeout),
            biomass_product: config.planet_biomass_product.clone(),
        }
    }

    /// Creates a biomass subscription for a field polygon over the policy
    /// window and returns the upstream-assigned subscription id.
    pub async fn create(
        &self,
        name: &str,
        geometry: &JsonValue,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String, PipelineError> {
        let payload = json!({
            "name": name,
            "source": {
                "type": "biomass",
                "parameters": {
                    "geometry": geometry,
                    "start_time": start.to_rfc3339(),
                    "end_time": end.to_rfc3339(),
                },
                "asset_types": [self.biomass_product],
            },
            "clip_to_source": true,
        });

        let url = format!("{}/subscriptions", self.base_url);
        let response = send_with_policy(&self.policy, "planet.create_subscription", || {
            self.http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;

        let envelope: SubscriptionEnvelope =
            decode_json("planet.create_subscription", response).await?;
        Ok(envelope.id)
    }

    pub async fn status(
        &self,
        subscription_id: &str,
    ) -> Result<UpstreamSubscriptionState, PipelineError> {
        let url = format!("{}/subscriptions/{subscription_id}", self.base_url);
        let response = send_with_policy(&self.policy, "planet.subscription_status", || {
            self.http
                .get(&url)
                .bearer_auth(&self.api_key)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        let envelope: SubscriptionStatusEnvelope =
            decode_json("planet.subscription_status", response).await?;
        Ok(envelope.status)
    }

    pub async fn results(&self, subscription_id: &str) -> Result<Vec<DeliveryRef>, PipelineError> {
        let url = format!("{}/subscriptions/{subscription_id}/results", self.base_url);
        let response = send_with_policy(&self.policy, "planet.subscription_results", || {
            self.http
                .get(&url)
                .bearer_auth(&self.api_key)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        let envelope: ResultsEnvelope =
            decode_json("planet.subscription_results", response).await?;
        Ok(envelope.results)
    }

    /// Downloads one delivered artifact as raw bytes (CSV for the biomass
    /// product).
    pub async fn fetch_delivery(&self, delivery: &DeliveryRef) -> Result<Vec<u8>, PipelineError> {
        let response = send_with_policy(&self.policy, "planet.fetch_delivery", || {
            self.http
                .get(&delivery.location)
                .bearer_auth(&self.api_key)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| {
                PipelineError::Transient(format!("planet.fetch_delivery body read failed: {err}"))
            })
    }

    pub async fn cancel(&self, subscription_id: &str) -> Result<(), PipelineError> {
        let url = format!("{}/subscriptions/{subscription_id}", self.base_url);
        send_with_policy(&self.policy, "planet.cancel_subscription", || {
            self.http
                .patch(&url)
                .bearer_auth(&self.api_key)
                .json(&json!({"status": "cancelled"}))
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_states_decode_from_snake_case() {
        let state: UpstreamSubscriptionState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(state, UpstreamSubscriptionState::Running);
        let state: UpstreamSubscriptionState = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(state, UpstreamSubscriptionState::Cancelled);
    }

    #[test]
    fn results_envelope_defaults_to_empty() {
        let envelope: ResultsEnvelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.results.is_empty());
    }
}
