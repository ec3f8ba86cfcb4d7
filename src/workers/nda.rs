use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::bus::{ConsumerConfig, EventBus, EventHandler};
use crate::db::{queries, Db};
use crate::models::event::SlotHeld;
use crate::models::{Envelope, HoldStatus};
use crate::services::documents;
use crate::services::holds::lock_db;
use crate::services::signing::{EnvelopeRequest, SigningProvider};
use crate::state::AppState;

/// `slot.held` consumer that opens the NDA signing workflow for
/// meeting types that require one.
pub struct NdaDispatcher {
    db: Db,
    bus: Arc<EventBus>,
    signing: Arc<dyn SigningProvider>,
}

impl NdaDispatcher {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            db: state.db.clone(),
            bus: Arc::clone(&state.bus),
            signing: Arc::clone(&state.signing),
        }
    }
}

pub fn consumer_config() -> ConsumerConfig {
    let mut config = ConsumerConfig::new("nda-dispatch", &["slot.held"]);
    // The signing provider is an external HTTP call
    config.ack_wait = Duration::from_secs(60);
    config
}

#[async_trait]
impl EventHandler for NdaDispatcher {
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()> {
        let payload: SlotHeld = event.payload()?;

        let hold = {
            let conn = lock_db(&self.db);
            let Some(hold) = queries::get_hold(&conn, &payload.hold_id)? else {
                // Hold vanished between publish and delivery
                return Ok(());
            };
            let requires_nda = queries::get_meeting_type(&conn, &hold.meeting_type_id)?
                .map(|mt| mt.requires_nda)
                .unwrap_or(false);
            if !requires_nda
                || hold.status != HoldStatus::Active
                || queries::get_document_by_hold(&conn, &hold.id)?.is_some()
            {
                return Ok(());
            }
            hold
        };

        // External call happens with the database lock released
        let envelope_id = self
            .signing
            .create_envelope(&EnvelopeRequest {
                hold_id: hold.id.clone(),
                signer_email: hold.guest_email.clone(),
                signer_name: hold.guest_name.clone(),
            })
            .await?;

        let created = {
            let conn = lock_db(&self.db);
            documents::create_for_hold(&conn, &hold, Some(envelope_id), Utc::now())?
        };

        if let Some((document, event)) = created {
            tracing::info!(
                document_id = %document.id,
                hold_id = %hold.id,
                "created NDA document"
            );
            self.bus.publish_all(&[event]);
        }
        Ok(())
    }
}
