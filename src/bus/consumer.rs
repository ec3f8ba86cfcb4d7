use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::params;

use super::EventBus;
use crate::db::{fmt_ts, parse_ts};
use crate::models::event::DeadLetter;
use crate::models::Envelope;

/// Delivery settings for a durable consumer.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub name: String,
    /// Exact subjects or trailing-wildcard filters ("slot.*").
    pub subjects: Vec<String>,
    /// Total deliveries before a message is dead-lettered.
    pub max_deliver: u32,
    /// Handler budget per delivery; exceeding it counts as a failure.
    pub ack_wait: Duration,
    pub deliver_policy: DeliverPolicy,
    /// Delay before redelivery, indexed by failure count and clamped
    /// to the last entry.
    pub backoff: Vec<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Replay retained matching events on registration.
    All,
    /// Start from the current tail.
    New,
}

impl ConsumerConfig {
    pub fn new(name: &str, subjects: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            deliver_policy: DeliverPolicy::All,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
        }
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let index = (failures.saturating_sub(1) as usize).min(self.backoff.len() - 1);
        self.backoff[index]
    }
}

#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()>;
}

pub(crate) fn subject_matches(filter: &str, subject: &str) -> bool {
    match filter.strip_suffix('*') {
        Some(prefix) => subject.starts_with(prefix),
        None => filter == subject,
    }
}

struct Claim {
    delivery_id: i64,
    /// Deliveries completed before this one.
    prior_attempts: u32,
    last_error: Option<String>,
    envelope: Envelope,
}

/// Polls the consumer's due deliveries and drives the ack/nak cycle.
/// Runs until the process exits; all state lives in the database, so a
/// crash mid-delivery is recovered by the stale-claim reclaim.
pub(crate) async fn run_dispatcher(
    bus: Arc<EventBus>,
    config: ConsumerConfig,
    handler: Arc<dyn EventHandler>,
) {
    let wake = bus.wake();
    loop {
        reclaim_stale(&bus, &config);

        let claim = match claim_next(&bus, &config) {
            Ok(claim) => claim,
            Err(e) => {
                tracing::error!(consumer = %config.name, error = %e, "failed to claim delivery");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(claim) = claim else {
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
            continue;
        };

        // prior_attempts counts deliveries already made; the handler
        // runs until max_deliver of them have failed
        if claim.prior_attempts >= config.max_deliver {
            dead_letter(&bus, &config, &claim);
            ack(&bus, claim.delivery_id);
            continue;
        }

        let outcome = tokio::time::timeout(config.ack_wait, handler.handle(&claim.envelope)).await;
        match outcome {
            Ok(Ok(())) => ack(&bus, claim.delivery_id),
            Ok(Err(e)) => {
                tracing::warn!(
                    consumer = %config.name,
                    subject = %claim.envelope.event_type,
                    attempt = claim.prior_attempts + 1,
                    error = %e,
                    "handler failed, scheduling redelivery"
                );
                nak(&bus, &config, &claim, &e.to_string());
            }
            Err(_) => {
                tracing::warn!(
                    consumer = %config.name,
                    subject = %claim.envelope.event_type,
                    "handler exceeded ack wait, scheduling redelivery"
                );
                nak(&bus, &config, &claim, "handler exceeded ack wait");
            }
        }
    }
}

fn claim_next(bus: &EventBus, config: &ConsumerConfig) -> anyhow::Result<Option<Claim>> {
    let conn = bus.lock_db();
    let now = fmt_ts(Utc::now());

    let row = conn
        .query_row(
            "SELECT d.id, d.attempts, d.last_error, e.event_id, e.subject, e.occurred_at, e.data
             FROM bus_deliveries d
             JOIN bus_events e ON e.seq = d.event_seq
             WHERE d.consumer = ?1 AND d.status = 'pending' AND d.next_attempt_at <= ?2
             ORDER BY d.event_seq
             LIMIT 1",
            params![config.name, now],
            |row| {
                let data: String = row.get(6)?;
                Ok(Claim {
                    delivery_id: row.get(0)?,
                    prior_attempts: row.get::<_, i64>(1)? as u32,
                    last_error: row.get(2)?,
                    envelope: Envelope {
                        event_id: row.get(3)?,
                        event_type: row.get(4)?,
                        occurred_at: parse_ts(&row.get::<_, String>(5)?),
                        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                    },
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if let Some(ref claim) = row {
        conn.execute(
            "UPDATE bus_deliveries
             SET status = 'processing', claimed_at = ?1, attempts = attempts + 1
             WHERE id = ?2",
            params![now, claim.delivery_id],
        )?;
    }
    Ok(row)
}

fn ack(bus: &EventBus, delivery_id: i64) {
    let conn = bus.lock_db();
    if let Err(e) = conn.execute(
        "UPDATE bus_deliveries SET status = 'acked' WHERE id = ?1",
        params![delivery_id],
    ) {
        tracing::error!(error = %e, delivery_id, "failed to ack delivery");
    }
}

fn nak(bus: &EventBus, config: &ConsumerConfig, claim: &Claim, error: &str) {
    let failures = claim.prior_attempts + 1;
    let delay = chrono::Duration::from_std(config.backoff_delay(failures))
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let next = fmt_ts(Utc::now() + delay);

    let conn = bus.lock_db();
    if let Err(e) = conn.execute(
        "UPDATE bus_deliveries
         SET status = 'pending', next_attempt_at = ?1, last_error = ?2
         WHERE id = ?3",
        params![next, error, claim.delivery_id],
    ) {
        tracing::error!(error = %e, delivery_id = claim.delivery_id, "failed to nak delivery");
    }
}

fn dead_letter(bus: &EventBus, config: &ConsumerConfig, claim: &Claim) {
    let payload = DeadLetter {
        original_subject: claim.envelope.event_type.clone(),
        original_event: claim.envelope.clone(),
        last_error: claim
            .last_error
            .clone()
            .unwrap_or_else(|| "retries exhausted".to_string()),
        attempts: i64::from(claim.prior_attempts),
    };
    tracing::error!(
        consumer = %config.name,
        subject = %claim.envelope.event_type,
        event_id = %claim.envelope.event_id,
        attempts = claim.prior_attempts,
        "retry budget exhausted, dead-lettering"
    );

    let subject = format!("dlq.{}", claim.envelope.event_type);
    match Envelope::new(&subject, &payload) {
        Ok(envelope) => {
            if let Err(e) = bus.publish(&envelope) {
                tracing::error!(error = %e, "failed to publish dead letter");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to build dead letter"),
    }
}

/// Returns `processing` rows whose claim is stale (the owning process
/// died mid-delivery) back to `pending`. In-process timeouts are
/// handled by the dispatcher itself, so the cutoff is generous.
fn reclaim_stale(bus: &EventBus, config: &ConsumerConfig) {
    let now = Utc::now();
    let cutoff = fmt_ts(
        now - chrono::Duration::from_std(config.ack_wait * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
    );
    let conn = bus.lock_db();
    if let Err(e) = conn.execute(
        "UPDATE bus_deliveries
         SET status = 'pending', next_attempt_at = ?1
         WHERE consumer = ?2 AND status = 'processing' AND claimed_at < ?3",
        params![fmt_ts(now), config.name, cutoff],
    ) {
        tracing::error!(error = %e, consumer = %config.name, "failed to reclaim stale deliveries");
    }
}
