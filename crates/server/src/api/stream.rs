//! The Stream Reader/Resumer (spec §4.D): serves `GET /runs/{id}/stream`
//! as SSE, replaying persisted entries past `startIndex` then switching
//! to the live broadcast, de-duplicating against the replay boundary,
//! and emitting `[DONE]` exactly once.

use super::ApiError;
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use shiioo_core::events::{EventLogEntry, DONE_MARKER};
use shiioo_core::storage::StreamItem;
use shiioo_core::{OrchestratorError, RunId};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default, rename = "startIndex")]
    start_index: u64,
}

fn to_sse_event(entry: &EventLogEntry) -> Event {
    Event::default()
        .id(entry.index.to_string())
        .data(serde_json::to_string(entry).unwrap_or_default())
}

/// Replays persisted entries past `start_index`, then tails live
/// broadcast entries, skipping any whose index falls at or before the
/// replay boundary (the subscribe/read_from race spec §4.D's contract
/// calls out). Loops internally without yielding until there is
/// something new to hand back, so `Lagged`/duplicate entries never
/// surface as empty events on the wire.
fn live_tail(
    rx: broadcast::Receiver<StreamItem>,
    last_replayed_index: u64,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold((rx, last_replayed_index, false), |(mut rx, last_index, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(StreamItem::Entry(entry)) => {
                    if entry.index > last_index {
                        let event = to_sse_event(&entry);
                        let next_index = entry.index;
                        return Some((Ok(event), (rx, next_index, false)));
                    }
                    // already delivered by the replay above; keep waiting.
                }
                Ok(StreamItem::Done) => {
                    return Some((Ok(Event::default().data(DONE_MARKER)), (rx, last_index, true)));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// `GET /runs/{id}/stream?startIndex=N` (and its `/code-mode` alias).
pub async fn run_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let run_id: RunId = id
        .parse()
        .map_err(|_| ApiError(OrchestratorError::bad_request("invalid run id")))?;
    // 404s on an unknown run.
    state.run_store.get_run(run_id).await?;

    // Subscribe before replaying so no event emitted in between is lost
    // (`EventLog::subscribe`'s documented usage).
    let rx = state.event_log.subscribe(run_id).await;
    let replay = state.event_log.read_from(run_id, query.start_index).await?;
    let last_replayed_index = replay.last().map(|e| e.index).unwrap_or(query.start_index);
    let already_closed = state.event_log.is_closed(run_id).await;

    let replay_stream = stream::iter(replay.iter().map(to_sse_event).map(Ok::<_, Infallible>).collect::<Vec<_>>());

    let sse_stream: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> = if already_closed {
        // The Done broadcast may already have fired before we subscribed;
        // a closed run never emits again, so the terminal marker has to
        // be synthesized here instead of waited for on `rx`.
        Box::pin(replay_stream.chain(stream::once(async { Ok(Event::default().data(DONE_MARKER)) })))
    } else {
        Box::pin(replay_stream.chain(live_tail(rx, last_replayed_index)))
    };

    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("heartbeat"))
        .into_response())
}
