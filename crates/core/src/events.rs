//! The closed event type set streamed over SSE (spec §6) and persisted in
//! the per-run append log (spec §4.C).

use crate::types::{RunKind, RunId, RunStatus, StepId, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event payloads. Variant names serialize as the wire's
/// kebab-case `type` tag (`run-started`, `step-finished`, ...); fields
/// serialize camelCase to match the table in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    RunStarted {
        kind: RunKind,
        workflow_run_id: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        step_id: StepId,
        step_name: String,
    },
    StepFinished {
        step_id: StepId,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        outputs: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    RunFinished {
        status: RunStatus,
    },
    Status {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Log {
        data: String,
    },
    AssistantDelta {
        text_delta: String,
    },
    ToolCall {
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_name: String,
        output: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
    },
    Exit {
        exit_code: i32,
    },
}

/// Maximum character length retained for a `tool-result` payload's
/// serialized `output` before truncation (Open Question, resolved in
/// DESIGN.md: 5000 chars with a trailing ellipsis and `truncated: true`).
pub const TOOL_RESULT_TRUNCATE_LEN: usize = 5000;

impl EventPayload {
    /// Apply the tool-result truncation policy. No-op for other variants.
    pub fn truncate_tool_result(self) -> Self {
        match self {
            EventPayload::ToolResult {
                tool_name,
                output,
                truncated: _,
            } => {
                let rendered = output.to_string();
                if rendered.len() <= TOOL_RESULT_TRUNCATE_LEN {
                    EventPayload::ToolResult {
                        tool_name,
                        output,
                        truncated: None,
                    }
                } else {
                    let mut clipped: String = rendered.chars().take(TOOL_RESULT_TRUNCATE_LEN).collect();
                    clipped.push('…');
                    EventPayload::ToolResult {
                        tool_name,
                        output: Value::String(clipped),
                        truncated: Some(true),
                    }
                }
            }
            other => other,
        }
    }
}

/// One entry in a run's indexed, append-only event log. `index` is
/// 1-based and assigned by the single writer for the run (spec §3,
/// invariant 3): gaps and duplicates are impossible by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub run_id: RunId,
    pub index: u64,
    pub recorded_at: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Sentinel the wire layer renders as a literal `data: [DONE]` frame.
/// Not itself an indexed entry — it closes the stream after the last
/// indexed event has been delivered.
pub const DONE_MARKER: &str = "[DONE]";
