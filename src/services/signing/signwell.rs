use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use super::{EnvelopeRequest, SigningProvider};

/// SignWell template-based document client.
pub struct SignwellClient {
    base_url: String,
    api_key: String,
    template_id: String,
    client: reqwest::Client,
}

impl SignwellClient {
    pub fn new(base_url: String, api_key: String, template_id: String) -> Self {
        Self {
            base_url,
            api_key,
            template_id,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct CreatedDocument {
    id: String,
}

#[async_trait]
impl SigningProvider for SignwellClient {
    async fn create_envelope(&self, request: &EnvelopeRequest) -> anyhow::Result<String> {
        let url = format!("{}/document_templates/documents", self.base_url);

        let body = serde_json::json!({
            "template_id": self.template_id,
            "embedded_signing": false,
            "recipients": [{
                "id": "1",
                "placeholder_name": "signer",
                "email": request.signer_email,
                "name": request.signer_name.as_deref().unwrap_or("Guest"),
            }],
            "custom_fields": [{
                "api_id": "hold_id",
                "value": request.hold_id,
            }],
        });

        let created: CreatedDocument = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to reach SignWell")?
            .error_for_status()
            .context("SignWell API returned error")?
            .json()
            .await
            .context("failed to decode SignWell response")?;

        Ok(created.id)
    }
}
