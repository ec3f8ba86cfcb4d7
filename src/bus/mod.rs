pub mod consumer;

pub use consumer::{ConsumerConfig, DeliverPolicy, EventHandler};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tokio::sync::{broadcast, Notify};

use crate::db::{fmt_ts, Db};
use crate::models::{Envelope, Stream};

/// Durable publish/subscribe log backed by the database.
///
/// Publishing appends to `bus_events` (deduplicated on `event_id`) and
/// fans a delivery row out to every registered durable consumer whose
/// subject filter matches. Ephemeral subscribers (the realtime gateway)
/// listen on an in-process broadcast channel instead and never see
/// backlog.
pub struct EventBus {
    db: Db,
    live_tx: broadcast::Sender<Envelope>,
    wake: Arc<Notify>,
}

impl EventBus {
    pub fn new(db: Db) -> Self {
        let (live_tx, _) = broadcast::channel(256);
        Self {
            db,
            live_tx,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Appends the event and fans out deliveries. Returns false when
    /// the `event_id` was already published (idempotent replay).
    pub fn publish(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        let stream = Stream::for_subject(&envelope.event_type);
        let inserted = {
            let conn = self.lock_db();
            let count = conn.execute(
                "INSERT OR IGNORE INTO bus_events (event_id, stream, subject, occurred_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    envelope.event_id,
                    stream.as_str(),
                    envelope.event_type,
                    fmt_ts(envelope.occurred_at),
                    envelope.data.to_string(),
                ],
            )?;

            if count > 0 {
                let seq = conn.last_insert_rowid();
                let now = fmt_ts(Utc::now());

                let consumers: Vec<(String, String)> = {
                    let mut stmt = conn.prepare("SELECT name, subjects FROM bus_consumers")?;
                    let rows = stmt.query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    rows.collect::<Result<_, _>>()?
                };
                for (name, subjects) in consumers {
                    let matched = subjects
                        .split(',')
                        .any(|filter| consumer::subject_matches(filter, &envelope.event_type));
                    if matched {
                        conn.execute(
                            "INSERT OR IGNORE INTO bus_deliveries (consumer, event_seq, status, attempts, next_attempt_at)
                             VALUES (?1, ?2, 'pending', 0, ?3)",
                            params![name, seq, now],
                        )?;
                    }
                }
                true
            } else {
                false
            }
        };

        if inserted {
            tracing::debug!(subject = %envelope.event_type, event_id = %envelope.event_id, "published event");
            // Ignore send errors: no live subscribers is fine
            let _ = self.live_tx.send(envelope.clone());
            self.wake.notify_waiters();
        }
        Ok(inserted)
    }

    /// Publishes a batch, logging and dropping failures. Used after a
    /// transaction has committed, where the state is already
    /// authoritative and a lost emission is caught up by replays.
    pub fn publish_all(&self, envelopes: &[Envelope]) {
        for envelope in envelopes {
            if let Err(e) = self.publish(envelope) {
                tracing::error!(error = %e, subject = %envelope.event_type, "failed to publish event");
            }
        }
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<Envelope> {
        self.live_tx.subscribe()
    }

    /// Registers a durable consumer and spawns its dispatch task.
    pub fn register(
        self: &Arc<Self>,
        config: ConsumerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> anyhow::Result<()> {
        {
            let conn = self.lock_db();
            conn.execute(
                "INSERT INTO bus_consumers (name, subjects) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET subjects = excluded.subjects",
                params![config.name, config.subjects.join(",")],
            )?;

            if config.deliver_policy == DeliverPolicy::All {
                // Backfill deliveries for retained events the consumer
                // has not seen; the unique index skips already-tracked
                // ones.
                let now = fmt_ts(Utc::now());
                let events: Vec<(i64, String)> = {
                    let mut stmt =
                        conn.prepare("SELECT seq, subject FROM bus_events ORDER BY seq")?;
                    let rows = stmt.query_map([], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })?;
                    rows.collect::<Result<_, _>>()?
                };
                for (seq, subject) in events {
                    let matched = config
                        .subjects
                        .iter()
                        .any(|filter| consumer::subject_matches(filter, &subject));
                    if matched {
                        conn.execute(
                            "INSERT OR IGNORE INTO bus_deliveries (consumer, event_seq, status, attempts, next_attempt_at)
                             VALUES (?1, ?2, 'pending', 0, ?3)",
                            params![config.name, seq, now],
                        )?;
                    }
                }
            }
        }

        tracing::info!(consumer = %config.name, subjects = ?config.subjects, "registered bus consumer");
        tokio::spawn(consumer::run_dispatcher(Arc::clone(self), config, handler));
        Ok(())
    }

    /// Prunes events past their stream's retention, keeping any event a
    /// consumer still has in flight, then drops orphaned deliveries.
    pub fn sweep_retention(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.lock_db();
        let mut removed = 0;
        for stream in [
            Stream::Bookings,
            Stream::Documents,
            Stream::Notifications,
            Stream::DeadLetter,
        ] {
            let cutoff = fmt_ts(now - Duration::hours(stream.retention_hours()));
            removed += conn.execute(
                "DELETE FROM bus_events
                 WHERE stream = ?1 AND occurred_at < ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM bus_deliveries d
                       WHERE d.event_seq = bus_events.seq AND d.status != 'acked'
                   )",
                params![stream.as_str(), cutoff],
            )?;
        }
        conn.execute(
            "DELETE FROM bus_deliveries
             WHERE event_seq NOT IN (SELECT seq FROM bus_events)",
            [],
        )?;
        Ok(removed)
    }

    pub(crate) fn lock_db(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    #[cfg(test)]
    pub fn events_with_subject(&self, subject: &str) -> Vec<Envelope> {
        let conn = self.lock_db();
        let mut stmt = conn
            .prepare(
                "SELECT event_id, subject, occurred_at, data FROM bus_events
                 WHERE subject = ?1 ORDER BY seq",
            )
            .unwrap();
        let rows = stmt
            .query_map(params![subject], |row| {
                Ok(Envelope {
                    event_id: row.get(0)?,
                    event_type: row.get(1)?,
                    occurred_at: crate::db::parse_ts(&row.get::<_, String>(2)?),
                    data: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .unwrap();
        rows.filter_map(|r| r.ok()).collect()
    }
}
