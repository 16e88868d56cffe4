use super::{decode_json, send_with_policy, RequestPolicy};
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use crate::json::{round_numbers, to_canonical_bytes};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

/// Content-addressed store client backed by a Pinata-style pinning API.
/// Documents are serialised canonically before upload, so identical inputs
/// always produce identical bytes and therefore identical cids.
pub struct ContentStoreClient {
    http: reqwest::Client,
    api_url: String,
    gateway: String,
    jwt: String,
    policy: RequestPolicy,
}

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

impl ContentStoreClient {
    pub fn from_config(config: &ProcessorConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            api_url: config.pinata_api_url.trim_end_matches('/').to_string(),
            gateway: config.pinata_gateway.clone(),
            jwt: config.pinata_jwt.clone(),
            policy: RequestPolicy::new(3, Duration::from_secs(30)),
        }
    }

    /// Uploads a JSON document and returns its content identifier. The bytes
    /// put on the wire are the canonical serialisation of `document`.
    pub async fn put_json(
        &self,
        name: &str,
        document: &JsonValue,
        metadata: &[(&str, &str)],
    ) -> Result<String, PipelineError> {
        let canonical = to_canonical_bytes(&round_numbers(document.clone()));

        let mut keyvalues = serde_json::Map::new();
        for (key, value) in metadata {
            keyvalues.insert((*key).to_string(), json!(value));
        }
        let pinata_metadata = json!({
            "name": name,
            "keyvalues": JsonValue::Object(keyvalues),
        });

        let url = format!("{}/pinning/pinFileToIPFS", self.api_url);
        let file_name = name.to_string();
        let response = send_with_policy(&self.policy, "ipfs.put_json", || {
            let part = reqwest::multipart::Part::bytes(canonical.clone())
                .file_name(file_name.clone())
                .mime_str("application/json")
                .expect("static mime type is valid");
            let form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("pinataMetadata", pinata_metadata.to_string());
            self.http
                .post(&url)
                .bearer_auth(&self.jwt)
                .multipart(form)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;

        let pinned: PinResponse = decode_json("ipfs.put_json", response).await?;
        Ok(pinned.ipfs_hash)
    }

    pub async fn get_json(&self, cid: &str) -> Result<JsonValue, PipelineError> {
        let url = self.url_for(cid);
        let response = send_with_policy(&self.policy, "ipfs.get_json", || {
            self.http
                .get(&url)
                .bearer_auth(&self.jwt)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        decode_json("ipfs.get_json", response).await
    }

    pub async fn pin(&self, cid: &str, name: Option<&str>) -> Result<(), PipelineError> {
        let url = format!("{}/pinning/pinByHash", self.api_url);
        let payload = json!({
            "hashToPin": cid,
            "pinataMetadata": { "name": name.unwrap_or(cid) },
        });
        send_with_policy(&self.policy, "ipfs.pin", || {
            self.http
                .post(&url)
                .bearer_auth(&self.jwt)
                .json(&payload)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        Ok(())
    }

    pub async fn unpin(&self, cid: &str) -> Result<(), PipelineError> {
        let url = format!("{}/pinning/unpin/{cid}", self.api_url);
        send_with_policy(&self.policy, "ipfs.unpin", || {
            self.http
                .delete(&url)
                .bearer_auth(&self.jwt)
                .timeout(self.policy.deadline)
                .send()
        })
        .await?;
        Ok(())
    }

    pub fn url_for(&self, cid: &str) -> String {
        format!("https://{}/ipfs/{cid}", self.gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> ContentStoreClient {
        ContentStoreClient {
            http: reqwest::Client::new(),
            api_url: "https://api.pinata.cloud".to_string(),
            gateway: "gateway.pinata.cloud".to_string(),
            jwt: "test".to_string(),
            policy: RequestPolicy::new(1, Duration::from_secs(5)),
        }
    }

    #[test]
    fn gateway_url_embeds_cid() {
        let client = test_client();
        assert_eq!(
            client.url_for("QmAbC123"),
            "https://gateway.pinata.cloud/ipfs/QmAbC123"
        );
    }
}
