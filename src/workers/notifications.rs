use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::bus::{ConsumerConfig, EventBus, EventHandler};
use crate::db::{queries, Db};
use crate::models::event::{BookingConfirmed, EmailRequested, EmailSent};
use crate::models::{subjects, Envelope};
use crate::services::email::EmailProvider;
use crate::services::holds::lock_db;
use crate::state::AppState;

/// `booking.confirmed` consumer that turns a confirmation into an
/// email request on the NOTIFICATIONS stream.
pub struct ConfirmationNotifier {
    db: Db,
    bus: Arc<EventBus>,
    app_url: String,
}

impl ConfirmationNotifier {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            db: state.db.clone(),
            bus: Arc::clone(&state.bus),
            app_url: state.config.app_url.trim_end_matches('/').to_string(),
        }
    }
}

pub fn confirmation_config() -> ConsumerConfig {
    ConsumerConfig::new("confirmation-notifier", &["booking.confirmed"])
}

#[async_trait]
impl EventHandler for ConfirmationNotifier {
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()> {
        let payload: BookingConfirmed = event.payload()?;

        let (meeting_name, host_name) = {
            let conn = lock_db(&self.db);
            let meeting_type = queries::get_meeting_type(&conn, &payload.meeting_type_id)?;
            let host_name = match meeting_type {
                Some(ref mt) => queries::get_host(&conn, &mt.host_id)?.map(|h| h.name),
                None => None,
            };
            (
                meeting_type.map(|mt| mt.name).unwrap_or_else(|| "meeting".to_string()),
                host_name.unwrap_or_else(|| "your host".to_string()),
            )
        };

        let request = EmailRequested {
            booking_id: payload.booking_id.clone(),
            to: payload.guest_email.clone(),
            subject: format!("Confirmed: {meeting_name} with {host_name}"),
            body: format!(
                "Hi {},\n\nYour {} with {} is confirmed for {}.\n\nManage your booking: {}/bookings/{}\n",
                payload.guest_name,
                meeting_name,
                host_name,
                payload.slot_start.to_rfc3339(),
                self.app_url,
                payload.booking_id,
            ),
        };

        let mut envelope = Envelope::new(subjects::EMAIL_REQUESTED, &request)?;
        // Deterministic id: a redelivered confirmation dedups at publish
        envelope.event_id = Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("email-requested:{}", payload.booking_id).as_bytes(),
        )
        .to_string();
        self.bus.publish_all(&[envelope]);
        Ok(())
    }
}

/// `notify.email.requested` consumer that hands the message to the
/// email provider.
pub struct EmailSender {
    bus: Arc<EventBus>,
    email: Arc<dyn EmailProvider>,
}

impl EmailSender {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            bus: Arc::clone(&state.bus),
            email: Arc::clone(&state.email),
        }
    }
}

pub fn sender_config() -> ConsumerConfig {
    let mut config = ConsumerConfig::new("email-sender", &["notify.email.requested"]);
    // Outbound provider call
    config.ack_wait = Duration::from_secs(60);
    config
}

#[async_trait]
impl EventHandler for EmailSender {
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()> {
        let request: EmailRequested = event.payload()?;

        self.email
            .send(&request.to, &request.subject, &request.body)
            .await?;

        let mut envelope = Envelope::new(
            subjects::EMAIL_SENT,
            &EmailSent {
                booking_id: request.booking_id.clone(),
                to: request.to.clone(),
            },
        )?;
        envelope.event_id = Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("email-sent:{}", request.booking_id).as_bytes(),
        )
        .to_string();
        self.bus.publish_all(&[envelope]);
        Ok(())
    }
}
