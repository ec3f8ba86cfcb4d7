pub mod resend;

use async_trait::async_trait;

/// Outbound transactional email. Absent credentials degrade delivery
/// to a no-op without affecting the booking core.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

pub struct NoopEmail;

#[async_trait]
impl EmailProvider for NoopEmail {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> anyhow::Result<()> {
        tracing::debug!(to, subject, "email provider not configured, dropping message");
        Ok(())
    }
}
