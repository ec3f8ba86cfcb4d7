use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use slotbook::bus::EventBus;
use slotbook::config::AppConfig;
use slotbook::db;
use slotbook::handlers;
use slotbook::rate_limit::RateLimiter;
use slotbook::services::email::{EmailProvider, NoopEmail};
use slotbook::services::email::resend::ResendMailer;
use slotbook::services::holds::SlotLocks;
use slotbook::services::signing::signwell::SignwellClient;
use slotbook::services::signing::{NoopSigning, SigningProvider};
use slotbook::state::AppState;
use slotbook::workers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    if config.webhook_shared_secret.is_empty() {
        tracing::warn!("WEBHOOK_SHARED_SECRET is not set; webhook signatures will not be verified");
    }

    let db = db::open_shared(&config.database_url)?;
    let bus = Arc::new(EventBus::new(db.clone()));

    let signing: Arc<dyn SigningProvider> = if config.signwell_api_key.is_empty() {
        tracing::info!("no SignWell credentials; NDA envelopes use local ids");
        Arc::new(NoopSigning)
    } else {
        Arc::new(SignwellClient::new(
            config.signwell_base_url.clone(),
            config.signwell_api_key.clone(),
            config.signwell_template_id.clone(),
        ))
    };

    let email: Arc<dyn EmailProvider> = if config.resend_api_key.is_empty() {
        tracing::info!("no Resend credentials; confirmation emails are dropped");
        Arc::new(NoopEmail)
    } else {
        Arc::new(ResendMailer::new(
            config.resend_api_key.clone(),
            config.email_from.clone(),
        ))
    };

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        bus,
        signing,
        email,
        rate_limiter: RateLimiter::new(),
        slot_locks: SlotLocks::new(),
    });

    workers::start(&state)?;

    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
