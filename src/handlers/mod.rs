pub mod booking;
pub mod health;
pub mod realtime;
pub mod webhook;

use std::sync::Arc;

use axum::http::header::CONTENT_TYPE;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    let mut app = Router::new()
        .route("/health", get(health::health))
        .route("/book/:slug", get(booking::get_meeting_type))
        .route("/book/:slug/slots", get(booking::get_slots))
        .route("/book/:slug/hold", post(booking::create_hold))
        .route(
            "/book/:slug/hold/:id",
            get(booking::get_hold).delete(booking::release_hold),
        )
        .route("/book/:slug/confirm", post(booking::confirm_booking))
        .route(
            "/realtime/slots/:meeting_type_id",
            get(realtime::slot_events),
        )
        .route("/webhooks/signwell", post(webhook::signwell_webhook))
        .with_state(state);

    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app
}

/// No configured origins means no CORS layer; misconfigured origins
/// fail at startup rather than at request time.
fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let origins: Vec<axum::http::HeaderValue> = origins
        .iter()
        .map(|o| {
            o.parse()
                .unwrap_or_else(|e| panic!("invalid CORS origin '{o}': {e}"))
        })
        .collect();

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([CONTENT_TYPE]),
    )
}
