//! Resumable SSE client: a reusable implementation of spec §4.D's
//! normative client algorithm — persist a cursor, advance it on every
//! received chunk (even an unparseable one), stop cleanly on `[DONE]`,
//! and reconnect with backoff on an unannounced disconnect up to a
//! bounded number of attempts.
//!
//! Text accumulation/flush pacing for `assistant-delta`/`log` events
//! (spec §4.D point 5) is a rendering concern of the UI client this SDK
//! does not have; callers that render incremental text should batch
//! `StreamEvent::Entry` themselves on their own interval.

use crate::client::ShiiooClient;
use crate::error::{ShiiooError, ShiiooResult};
use bytes::Bytes;
use futures::StreamExt;
use shiioo_core::events::EventLogEntry;
use shiioo_core::RunId;
use std::pin::Pin;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::io::StreamReader;

/// Bounded reconnect attempts before the stream gives up and surfaces
/// `interrupted` (spec §4.D point 4: "give up after a bounded number of
/// attempts (e.g. 3)").
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

const DONE_MARKER: &str = "[DONE]";

type ByteStream = Pin<Box<dyn futures::Stream<Item = std::io::Result<Bytes>> + Send>>;

fn to_io_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
    )
}

/// One item observed from the stream: either a parsed log entry or a
/// chunk that failed to parse (spec §4.D: "a parse failure on one chunk
/// must not stop the stream ... it skips that chunk ... but still
/// advances the cursor").
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Entry(EventLogEntry),
    Unparsed(String),
}

/// A live subscription to a run's event log, resumable from a
/// caller-supplied `startIndex` cursor (spec §4.D).
pub struct ResumableStream {
    client: ShiiooClient,
    base_path: &'static str,
    run_id: RunId,
    cursor: u64,
    lines: Lines<BufReader<StreamReader<ByteStream, Bytes>>>,
    done: bool,
    interrupted: bool,
    reconnect_attempts: u32,
}

impl ResumableStream {
    /// Opens `GET {base_path}/{run_id}/stream?startIndex={start_index}`.
    pub async fn connect(
        client: ShiiooClient,
        base_path: &'static str,
        run_id: RunId,
        start_index: u64,
    ) -> ShiiooResult<Self> {
        let lines = Self::open(&client, base_path, run_id, start_index).await?;
        Ok(Self {
            client,
            base_path,
            run_id,
            cursor: start_index,
            lines,
            done: false,
            interrupted: false,
            reconnect_attempts: 0,
        })
    }

    async fn open(
        client: &ShiiooClient,
        base_path: &str,
        run_id: RunId,
        start_index: u64,
    ) -> ShiiooResult<Lines<BufReader<StreamReader<ByteStream, Bytes>>>> {
        let path = format!("{base_path}/{run_id}/stream");
        let response = client
            .http()
            .get_stream(&path, &[("startIndex", start_index.to_string())])
            .await?;
        let byte_stream = to_io_stream(response);
        let reader = BufReader::new(StreamReader::new(byte_stream));
        Ok(reader.lines())
    }

    /// The caller's current cursor: persist this (keyed by run id) so a
    /// fresh process can resume from where this one left off.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// `true` once `[DONE]` has been observed; no further events follow.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// `true` if the underlying connection dropped before `[DONE]` and
    /// reconnect attempts were exhausted (spec §4.D scenario 6).
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Returns the next stream item, or `Ok(None)` once `[DONE]` has
    /// been consumed. Transparently reconnects on a dropped connection
    /// using the client's configured backoff schedule, resuming from the
    /// last-advanced cursor.
    pub async fn next_event(&mut self) -> ShiiooResult<Option<StreamEvent>> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    // SSE comments (heartbeats) and non-`data:` fields are
                    // ignored per spec §4.D.
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == DONE_MARKER {
                        self.done = true;
                        self.cursor = 0;
                        return Ok(None);
                    }

                    // Advance the cursor for every assigned chunk, parseable
                    // or not — the server already assigned it an index.
                    self.cursor += 1;
                    self.reconnect_attempts = 0;
                    return match serde_json::from_str::<EventLogEntry>(data) {
                        Ok(entry) => Ok(Some(StreamEvent::Entry(entry))),
                        Err(_) => Ok(Some(StreamEvent::Unparsed(data.to_string()))),
                    };
                }
                Ok(None) => {
                    // Connection closed without `[DONE]`.
                    self.reconnect().await?;
                }
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, error = %e, "stream read error");
                    self.reconnect().await?;
                }
            }
        }
    }

    async fn reconnect(&mut self) -> ShiiooResult<()> {
        self.interrupted = true;
        loop {
            if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                return Err(ShiiooError::StreamInterrupted);
            }
            let backoff = self
                .client
                .config()
                .retry_config
                .backoff_for_attempt(self.reconnect_attempts);
            self.reconnect_attempts += 1;
            tokio::time::sleep(backoff).await;

            // A reconnect attempt that itself fails to open (a transient
            // connection error, not just an early close) still counts
            // against the attempt budget and is retried in turn, rather
            // than surfacing immediately on the first failure.
            match Self::open(&self.client, self.base_path, self.run_id, self.cursor).await {
                Ok(lines) => {
                    self.lines = lines;
                    self.interrupted = false;
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsed_event_preserves_raw_text() {
        let event = StreamEvent::Unparsed("not json".to_string());
        match event {
            StreamEvent::Unparsed(s) => assert_eq!(s, "not json"),
            _ => panic!("expected Unparsed"),
        }
    }
}
