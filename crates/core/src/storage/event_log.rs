//! The Event Writer (spec §4.C) and the persisted side of the Stream
//! Reader/Resumer (spec §4.D): a single-writer-per-run indexed append log,
//! backed by a JSONL file per run and fanned out live via a broadcast
//! channel so late subscribers can still replay from disk.

use crate::error::{OrchestratorError, Result};
use crate::events::EventLogEntry;
use crate::events::EventPayload;
use crate::types::RunId;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

/// What a live subscriber receives: either the next indexed entry, or the
/// terminal marker. Mirrors the wire's `data: ...` / `data: [DONE]` split.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Entry(EventLogEntry),
    Done,
}

struct RunLog {
    next_index: u64,
    closed: bool,
    sender: broadcast::Sender<StreamItem>,
}

/// Per-run indexed append log. `emit` is the only place an index is
/// assigned, under a per-run lock, so indices can never gap or
/// duplicate (spec invariant 3) even with concurrent callers.
pub struct EventLog {
    base_path: PathBuf,
    runs: Mutex<HashMap<RunId, Arc<Mutex<RunLog>>>>,
}

impl EventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .map_err(|e| OrchestratorError::env_invalid("Failed to create event log directory").with_cause(e))?;
        Ok(Self {
            base_path,
            runs: Mutex::new(HashMap::new()),
        })
    }

    fn log_path(&self, run_id: RunId) -> PathBuf {
        self.base_path.join(format!("{run_id}.jsonl"))
    }

    async fn run_log(&self, run_id: RunId) -> Arc<Mutex<RunLog>> {
        let mut runs = self.runs.lock().await;
        runs.entry(run_id)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(1024);
                Arc::new(Mutex::new(RunLog {
                    next_index: 1,
                    closed: false,
                    sender,
                }))
            })
            .clone()
    }

    /// Append one entry and return its assigned 1-based index.
    pub async fn emit(&self, run_id: RunId, payload: EventPayload) -> Result<u64> {
        let run_log = self.run_log(run_id).await;
        let mut state = run_log.lock().await;
        if state.closed {
            return Err(OrchestratorError::stream_closed());
        }

        let entry = EventLogEntry {
            run_id,
            index: state.next_index,
            recorded_at: Utc::now(),
            payload: payload.truncate_tool_result(),
        };
        state.next_index += 1;

        self.append_to_disk(run_id, &entry).await?;
        let _ = state.sender.send(StreamItem::Entry(entry.clone()));
        Ok(entry.index)
    }

    /// Idempotent: appends the terminal marker once. Subsequent calls are
    /// no-ops (testable property 6: `[DONE]` exactly once per run).
    pub async fn close(&self, run_id: RunId) -> Result<()> {
        let run_log = self.run_log(run_id).await;
        let mut state = run_log.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let _ = state.sender.send(StreamItem::Done);
        Ok(())
    }

    pub async fn is_closed(&self, run_id: RunId) -> bool {
        let run_log = self.run_log(run_id).await;
        let state = run_log.lock().await;
        state.closed
    }

    /// Subscribe for live delivery. Combined with `read_from` by the
    /// stream handler to avoid missing entries emitted between the
    /// initial replay and the subscription being established.
    pub async fn subscribe(&self, run_id: RunId) -> broadcast::Receiver<StreamItem> {
        let run_log = self.run_log(run_id).await;
        let state = run_log.lock().await;
        state.sender.subscribe()
    }

    /// Replay all persisted entries with `index > start_index`.
    pub async fn read_from(&self, run_id: RunId, start_index: u64) -> Result<Vec<EventLogEntry>> {
        let path = self.log_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::env_invalid("Failed to read event log").with_cause(e))?;
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let entry: EventLogEntry = serde_json::from_str(line)
                .map_err(|e| OrchestratorError::env_invalid("Corrupt event log entry").with_cause(e))?;
            if entry.index > start_index {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn append_to_disk(&self, run_id: RunId, entry: &EventLogEntry) -> Result<()> {
        let path = self.log_path(run_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| OrchestratorError::env_invalid("Failed to open event log").with_cause(e))?;
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| OrchestratorError::env_invalid("Failed to serialize event").with_cause(e))?;
        line.push(b'\n');
        file.write_all(&line)
            .await
            .map_err(|e| OrchestratorError::env_invalid("Failed to write event").with_cause(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn indices_are_monotonic_with_no_gaps() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().to_path_buf()).unwrap();
        let run_id = RunId::new();

        let i1 = log.emit(run_id, EventPayload::Log { data: "a".into() }).await.unwrap();
        let i2 = log.emit(run_id, EventPayload::Log { data: "b".into() }).await.unwrap();
        let i3 = log.emit(run_id, EventPayload::Log { data: "c".into() }).await.unwrap();

        assert_eq!((i1, i2, i3), (1, 2, 3));
    }

    #[tokio::test]
    async fn emit_after_close_fails_with_stream_closed() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().to_path_buf()).unwrap();
        let run_id = RunId::new();

        log.emit(run_id, EventPayload::Log { data: "a".into() }).await.unwrap();
        log.close(run_id).await.unwrap();
        log.close(run_id).await.unwrap(); // idempotent

        let err = log
            .emit(run_id, EventPayload::Log { data: "b".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::StreamClosed);
    }

    #[tokio::test]
    async fn read_from_replays_only_newer_entries() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().to_path_buf()).unwrap();
        let run_id = RunId::new();

        for i in 0..5 {
            log.emit(run_id, EventPayload::Log { data: i.to_string() }).await.unwrap();
        }

        let replay = log.read_from(run_id, 3).await.unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].index, 4);
        assert_eq!(replay[1].index, 5);
    }
}
