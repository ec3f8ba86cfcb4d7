use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::db::queries;
use crate::errors::AppError;
use crate::models::{Envelope, WebhookStatus};
use crate::services::documents;
use crate::services::holds::lock_db;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const PROVIDER: &str = "signwell";
const SIGNATURE_HEADER: &str = "x-signwell-signature";

#[derive(Deserialize)]
pub struct SignwellEvent {
    pub event: String,
    pub document: SignwellDocument,
}

#[derive(Deserialize)]
pub struct SignwellDocument {
    pub id: String,
    #[serde(default)]
    pub custom_fields: Vec<SignwellField>,
}

#[derive(Deserialize)]
pub struct SignwellField {
    pub api_id: String,
    pub value: String,
}

enum Outcome {
    Replayed(String),
    Processed(String, Vec<Envelope>),
    Failed(anyhow::Error),
}

/// E-signature provider callback, idempotent on
/// `(provider, "{document_id}:{event}")`. A completed callback replays
/// its cached response; a failed one is retried by the provider and
/// re-enters cleanly.
pub async fn signwell_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if state.config.webhook_shared_secret.is_empty() {
        tracing::warn!("webhook signature verification disabled: no shared secret configured");
    } else {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::WebhookAuth)?;
        verify_signature(&state.config.webhook_shared_secret, &body, provided)?;
    }

    let payload: SignwellEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("malformed webhook payload: {e}")))?;

    let hold_id = payload
        .document
        .custom_fields
        .iter()
        .find(|f| f.api_id == "hold_id")
        .map(|f| f.value.clone())
        .ok_or_else(|| AppError::Validation("missing hold_id custom field".to_string()))?;

    let webhook_id = format!("{}:{}", payload.document.id, payload.event);
    let raw = String::from_utf8_lossy(&body).to_string();
    let now = Utc::now();

    let outcome = {
        let mut conn = lock_db(&state.db);
        let tx = conn.transaction().map_err(anyhow::Error::from)?;

        let replay = queries::get_processed_webhook(&tx, PROVIDER, &webhook_id)?
            .filter(|record| record.status == WebhookStatus::Completed);
        if let Some(record) = replay {
            Outcome::Replayed(
                record
                    .response_body
                    .unwrap_or_else(|| r#"{"ok":true}"#.to_string()),
            )
        } else {
            queries::insert_processing_webhook(&tx, PROVIDER, &webhook_id, now)?;
            match documents::handle_provider_event(&tx, &payload.event, &hold_id, &raw, now) {
                Ok((response, events)) => {
                    let response = response.to_string();
                    queries::finish_webhook(
                        &tx,
                        PROVIDER,
                        &webhook_id,
                        WebhookStatus::Completed,
                        Some(&response),
                        now,
                    )?;
                    tx.commit().map_err(anyhow::Error::from)?;
                    Outcome::Processed(response, events)
                }
                Err(e) => {
                    // Roll back the document changes but keep the failed
                    // marker so the provider's retry re-enters
                    drop(tx);
                    queries::insert_processing_webhook(&conn, PROVIDER, &webhook_id, now)?;
                    queries::finish_webhook(
                        &conn,
                        PROVIDER,
                        &webhook_id,
                        WebhookStatus::Failed,
                        None,
                        now,
                    )?;
                    Outcome::Failed(e)
                }
            }
        }
    };

    match outcome {
        Outcome::Replayed(cached) => {
            tracing::debug!(webhook_id = %webhook_id, "replaying cached webhook response");
            Ok(json_response(cached))
        }
        Outcome::Processed(response, events) => {
            state.bus.publish_all(&events);
            Ok(json_response(response))
        }
        Outcome::Failed(e) => Err(AppError::Transient(e)),
    }
}

fn json_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Hex HMAC-SHA-256 of the raw body, compared in constant time.
fn verify_signature(secret: &str, body: &[u8], provided: &str) -> Result<(), AppError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AppError::WebhookAuth)?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if constant_time_compare(&expected, provided.trim().to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(AppError::WebhookAuth)
    }
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Signature the provider attaches to a payload; counterpart of
/// [`verify_signature`].
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
