pub mod signwell;

use async_trait::async_trait;

pub struct EnvelopeRequest {
    pub hold_id: String,
    pub signer_email: String,
    pub signer_name: Option<String>,
}

/// Client for the external e-signature provider. The provider sends
/// the NDA to the signer and reports progress back through webhooks.
#[async_trait]
pub trait SigningProvider: Send + Sync {
    /// Creates a signing envelope and returns its external id.
    async fn create_envelope(&self, request: &EnvelopeRequest) -> anyhow::Result<String>;
}

/// Stand-in used when no API key is configured. Documents created
/// through it stay pending until a webhook (or an operator) advances
/// them.
pub struct NoopSigning;

#[async_trait]
impl SigningProvider for NoopSigning {
    async fn create_envelope(&self, request: &EnvelopeRequest) -> anyhow::Result<String> {
        tracing::debug!(hold_id = %request.hold_id, "signing provider not configured, issuing local envelope id");
        Ok(format!("local_{}", uuid::Uuid::new_v4()))
    }
}
