use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::db::queries;
use crate::models::event::{NdaCreated, NdaExpired, NdaSent, NdaSigned};
use crate::models::{subjects, Document, DocumentStatus, Envelope, Hold};

/// Creates the pending NDA document for a hold. Returns None when one
/// already exists (a redelivered `slot.held`, for instance).
pub fn create_for_hold(
    conn: &Connection,
    hold: &Hold,
    envelope_id: Option<String>,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<(Document, Envelope)>> {
    let document = Document {
        id: uuid::Uuid::new_v4().to_string(),
        hold_id: hold.id.clone(),
        booking_id: None,
        status: DocumentStatus::Pending,
        signer_email: hold.guest_email.clone(),
        signer_name: hold.guest_name.clone(),
        envelope_id,
        created_at: now,
        sent_at: None,
        signed_at: None,
        updated_at: now,
    };

    if !queries::insert_document(conn, &document)? {
        return Ok(None);
    }

    let event = Envelope::new(
        subjects::NDA_CREATED,
        &NdaCreated {
            meeting_type_id: hold.meeting_type_id.clone(),
            document_id: document.id.clone(),
            hold_id: document.hold_id.clone(),
            envelope_id: document.envelope_id.clone(),
        },
    )?;
    Ok(Some((document, event)))
}

/// Advances a document's state for one provider callback and returns
/// the response body to cache plus the events to publish after commit.
///
/// Transitions are forward-only; an event arriving after the document
/// already moved past the target state changes nothing and emits
/// nothing, which keeps webhook redeliveries idempotent.
pub fn handle_provider_event(
    conn: &Connection,
    event_name: &str,
    hold_id: &str,
    audit: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<(serde_json::Value, Vec<Envelope>)> {
    let document = queries::get_document_by_hold(conn, hold_id)?
        .ok_or_else(|| anyhow::anyhow!("no document for hold {hold_id}"))?;

    use DocumentStatus::*;
    let mut events = vec![];

    match event_name {
        "document_sent" | "document_viewed" => {
            if queries::transition_document(conn, &document.id, &[Pending], Sent, now, Some(audit))?
            {
                events.push(Envelope::new(
                    subjects::NDA_SENT,
                    &NdaSent {
                        document_id: document.id.clone(),
                        hold_id: document.hold_id.clone(),
                    },
                )?);
            }
        }
        "document_completed" => {
            if queries::transition_document(
                conn,
                &document.id,
                &[Pending, Sent],
                Signed,
                now,
                Some(audit),
            )? {
                events.push(Envelope::new(
                    subjects::NDA_SIGNED,
                    &NdaSigned {
                        document_id: document.id.clone(),
                        hold_id: document.hold_id.clone(),
                        signed_at: now,
                    },
                )?);
            }
        }
        "document_expired" => {
            if queries::transition_document(
                conn,
                &document.id,
                &[Pending, Sent],
                Expired,
                now,
                Some(audit),
            )? {
                events.push(Envelope::new(
                    subjects::NDA_EXPIRED,
                    &NdaExpired {
                        document_id: document.id.clone(),
                        hold_id: document.hold_id.clone(),
                    },
                )?);
            }
        }
        "document_declined" => {
            queries::transition_document(
                conn,
                &document.id,
                &[Pending, Sent],
                Revoked,
                now,
                Some(audit),
            )?;
        }
        other => {
            tracing::debug!(event = other, "ignoring unhandled e-signature event");
            return Ok((
                serde_json::json!({ "ok": true, "ignored": true }),
                vec![],
            ));
        }
    }

    Ok((
        serde_json::json!({ "ok": true, "documentId": document.id }),
        events,
    ))
}
