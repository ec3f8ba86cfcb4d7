use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::StreamExt;

use crate::state::AppState;

/// SSE stream of slot and booking activity for one meeting type.
///
/// Subscriptions are ephemeral and new-only: no backlog is replayed,
/// because a connecting client fetches the current grid with a fresh
/// slots request. Frames carry the event type as the SSE `event`
/// field, the envelope id as `id`, and the event data as payload.
pub async fn slot_events(
    State(state): State<Arc<AppState>>,
    Path(meeting_type_id): Path<String>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe_live();

    let connected = tokio_stream::once(Ok::<_, Infallible>(
        Event::default().event("connected").data(
            serde_json::json!({ "meetingTypeId": meeting_type_id.clone() }).to_string(),
        ),
    ));

    let live = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(envelope) => {
            let relevant = (envelope.event_type.starts_with("slot.")
                || envelope.event_type.starts_with("booking."))
                && envelope.meeting_type_id() == Some(meeting_type_id.as_str());
            if relevant {
                Some(Ok(Event::default()
                    .event(envelope.event_type.clone())
                    .id(envelope.event_id.clone())
                    .data(envelope.data.to_string())))
            } else {
                None
            }
        }
        // A lagging viewer misses events rather than stalling the
        // channel; its next slots fetch resynchronizes the grid
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "realtime subscriber lagged");
            None
        }
    });

    // First keepalive only after a full period, so the connected frame
    // is always the first thing a client sees
    let keepalive = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + Duration::from_secs(30),
        Duration::from_secs(30),
    ))
    .map(|_| Ok(Event::default().comment("keepalive")));

    let merged = StreamExt::merge(connected.chain(live), keepalive);
    Sse::new(merged)
}
