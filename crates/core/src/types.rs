//! Core data model: Run, Step, Approval, SandboxJob and their identifiers.
//!
//! Dynamic payloads (`metadata`, `inputs`, `outputs`, `error`) are
//! `serde_json::Value` rather than a hand-rolled sum type — the ecosystem's
//! own round-trippable JSON representation, treated as opaque except for
//! a few well-known keys (`message`, `stepId`, `toolName`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A stable, human-readable slug identifying a step within a run
/// (e.g. `"sandbox.checkout"`). Stable per workflow kind, not generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxJobId(pub Uuid);

impl SandboxJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SandboxJobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Content hash identifying a blob in a `BlobStore`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHash(pub String);

impl BlobHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(data);
        Self(hex::encode(hash))
    }
}

impl std::fmt::Display for BlobHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow kind. A run's kind selects a static step plan from the
/// orchestrator's registry; there is no dynamic branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Research,
    Implementation,
    CodeMode,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunKind::Research => "research",
            RunKind::Implementation => "implementation",
            RunKind::CodeMode => "code_mode",
        };
        f.write_str(s)
    }
}

/// Run & step status. Transitions are enforced by `step_service`, not by
/// this type — it is a plain data carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Blocked,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Terminal statuses never transition again (spec invariant 1).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

pub type StepStatus = RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Llm,
    Tool,
    Sandbox,
    Wait,
    Approval,
    ExternalPoll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub metadata: Value,
    pub workflow_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(project_id: impl Into<String>, kind: RunKind, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            project_id: project_id.into(),
            kind,
            status: RunStatus::Pending,
            metadata,
            workflow_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub run_id: RunId,
    pub step_id: StepId,
    pub step_kind: StepKind,
    pub step_name: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        run_id: RunId,
        step_id: StepId,
        step_kind: StepKind,
        step_name: impl Into<String>,
        inputs: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            step_id,
            step_kind,
            step_name: step_name.into(),
            status: StepStatus::Pending,
            attempt: 0,
            inputs,
            outputs: None,
            error: None,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub run_id: RunId,
    pub project_id: String,
    pub step_id: Option<StepId>,
    pub scope: String,
    pub intent_summary: String,
    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxJob {
    pub id: SandboxJobId,
    pub run_id: RunId,
    pub project_id: String,
    pub step_id: Option<StepId>,
    pub job_type: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub transcript_blob_ref: Option<BlobHash>,
    pub metadata: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxJob {
    pub fn new(run_id: RunId, project_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SandboxJobId::new(),
            run_id,
            project_id: project_id.into(),
            step_id: None,
            job_type: job_type.into(),
            status: StepStatus::Pending,
            exit_code: None,
            transcript_blob_ref: None,
            metadata: Value::Null,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A patch applied through `StepService::update_step`. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub ended_at: Option<Option<DateTime<Utc>>>,
    pub attempt: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn blob_hash_is_deterministic() {
        let a = BlobHash::from_bytes(b"hello");
        let b = BlobHash::from_bytes(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 64);
    }
}
