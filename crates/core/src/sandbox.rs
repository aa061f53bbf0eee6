//! The Sandbox Session Manager (spec §4.E): attaches/starts an external
//! sandbox VM, enforces a command allowlist before every invocation,
//! captures a size-capped transcript, and persists a transcript blob ref
//! exactly once.
//!
//! `SandboxBackend` is the capability trait that keeps any concrete VM
//! vendor out of the core (spec §1); the allowlist-decision shape is
//! grounded on `policy.rs`'s `PolicyEngine::check_tool_call ->
//! PolicyDecision`, narrowed to the single allow/deny axis a sandbox
//! command needs.

use crate::error::{OrchestratorError, Result};
use crate::storage::blob::BlobStore;
use crate::storage::run_store::RunStore;
use crate::types::{RunId, SandboxJob, SandboxJobId, StepId, StepStatus};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Network egress policy for a sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    None,
    AllowlistOnly,
    Unrestricted,
}

/// A single command to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

/// Outcome of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The decision an allowlist makes about one command, consulted before
/// every invocation (spec §4.E invariant: bypasses at any layer are a
/// bug — there is exactly one call site for this check, in
/// `SandboxSession::run_command`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowlistDecision {
    Allow,
    Deny { reason: String },
}

/// Narrows a command down to an allow/deny decision. Kept deliberately
/// small: the core ships one reference allowlist (`CommandAllowlist`)
/// and lets callers supply their own.
pub trait SandboxAllowlist: Send + Sync {
    fn check(&self, policy: &NetworkPolicy, cmd: &CommandRequest) -> AllowlistDecision;
}

/// A static, explicit allowlist of command names. The simplest policy
/// that satisfies spec §4.E; production deployments may supply a
/// richer implementation (parameter-aware, per-project).
pub struct CommandAllowlist {
    allowed: Vec<String>,
}

impl CommandAllowlist {
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl SandboxAllowlist for CommandAllowlist {
    fn check(&self, _policy: &NetworkPolicy, cmd: &CommandRequest) -> AllowlistDecision {
        if self.allowed.iter().any(|a| a == &cmd.cmd) {
            AllowlistDecision::Allow
        } else {
            AllowlistDecision::Deny {
                reason: format!("command `{}` is not on the allowlist", cmd.cmd),
            }
        }
    }
}

/// External VM capability. A concrete implementation owns the actual
/// sandbox vendor integration; the core never speaks to one directly.
#[async_trait::async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn create(&self, project_id: &str, network_policy: NetworkPolicy) -> Result<String>;
    async fn exec(&self, sandbox_id: &str, cmd: &CommandRequest) -> Result<CommandOutput>;
    async fn stop(&self, sandbox_id: &str) -> Result<()>;
}

/// Transcript buffer bounded by a maximum character count. Oldest data
/// is dropped when the cap is exceeded and `truncated` is set — the
/// boundary behavior from spec §8.
struct TranscriptBuffer {
    data: String,
    cap: usize,
    truncated: bool,
}

impl TranscriptBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: String::new(),
            cap,
            truncated: false,
        }
    }

    fn append(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        if self.data.len() > self.cap {
            let excess = self.data.len() - self.cap;
            let boundary = self
                .data
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= excess)
                .unwrap_or(self.data.len());
            self.data.drain(..boundary);
            self.truncated = true;
        }
    }
}

const TRANSCRIPT_CAP_CHARS: usize = 200_000;

/// A bounded-lifetime handle to an external VM (spec GLOSSARY). Owns its
/// transcript buffer exclusively; `run_command` and `finalize`/`cancel`
/// are the only ways its state changes.
pub struct SandboxSession {
    run_id: RunId,
    job_id: SandboxJobId,
    sandbox_id: String,
    stop_on_finalize: bool,
    backend: Arc<dyn SandboxBackend>,
    allowlist: Arc<dyn SandboxAllowlist>,
    store: Arc<dyn RunStore>,
    network_policy: NetworkPolicy,
    transcript: Mutex<TranscriptBuffer>,
    finalized: Mutex<bool>,
    blob_store_handle: Arc<dyn BlobStore>,
}

impl SandboxSession {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn job_id(&self) -> SandboxJobId {
        self.job_id
    }

    /// Enforces the allowlist before invoking the backend (spec §4.E).
    /// Fails if the session has already been finalized: transcripts are
    /// append-only within a session and close once finalize succeeds.
    pub async fn run_command(&self, cmd: CommandRequest) -> Result<CommandOutput> {
        if *self.finalized.lock().await {
            return Err(OrchestratorError::conflict(
                "sandbox session already finalized",
            ));
        }

        if let AllowlistDecision::Deny { reason } = self.allowlist.check(&self.network_policy, &cmd) {
            return Err(OrchestratorError::bad_request(format!(
                "command rejected by allowlist: {reason}"
            )));
        }

        self.store
            .update_sandbox_job_status(self.job_id, StepStatus::Running, None, &[
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Canceled,
            ])
            .await?;

        let timeout = cmd.timeout.unwrap_or(Duration::from_secs(300));
        let output = tokio::time::timeout(timeout, self.backend.exec(&self.sandbox_id, &cmd))
            .await
            .map_err(|_| OrchestratorError::upstream_timeout("sandbox command timed out"))??;

        let mut transcript = self.transcript.lock().await;
        transcript.append(&format!("$ {} {}\n", cmd.cmd, cmd.args.join(" ")));
        transcript.append(&output.stdout);
        transcript.append(&output.stderr);

        Ok(output)
    }

    /// Whether the transcript has dropped data to stay under the cap
    /// (spec §8 boundary behavior).
    pub async fn transcript_truncated(&self) -> bool {
        self.transcript.lock().await.truncated
    }

    /// Idempotent cancel: stops the backend VM when `stop_on_finalize`
    /// was requested, marks the job canceled, and skips transcript
    /// persistence entirely (spec §4.E).
    pub async fn cancel(&self) -> Result<()> {
        let mut finalized = self.finalized.lock().await;
        if *finalized {
            return Ok(());
        }
        *finalized = true;

        self.store
            .update_sandbox_job_status(self.job_id, StepStatus::Canceled, None, &[
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Canceled,
            ])
            .await?;

        if self.stop_on_finalize {
            // Best-effort: a failure to stop the VM must not block the
            // cancellation outcome the caller is waiting on.
            if let Err(e) = self.backend.stop(&self.sandbox_id).await {
                tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "failed to stop sandbox on cancel");
            }
        }
        Ok(())
    }

    /// Idempotent finalize: persists the transcript to the blob store
    /// best-effort (a persistence failure must not prevent the job
    /// status update, spec §4.E/§8 scenario 5), sets `transcript_blob_ref`
    /// write-once, records `exit_code`, and sets the terminal status.
    pub async fn finalize(&self, exit_code: i32, status: StepStatus) -> Result<()> {
        let mut finalized = self.finalized.lock().await;
        if *finalized {
            return Ok(());
        }
        *finalized = true;

        let transcript_bytes = {
            let transcript = self.transcript.lock().await;
            Bytes::from(transcript.data.clone())
        };

        let blob_store = self.blob_store();
        match blob_store.put(transcript_bytes).await {
            Ok(hash) => {
                if let Err(e) = self.store.set_transcript_blob_ref(self.job_id, hash).await {
                    tracing::warn!(job_id = %self.job_id.0, error = %e, "failed to record transcript blob ref");
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id.0, error = %e, "transcript persistence failed; job status unaffected");
            }
        }

        self.store
            .update_sandbox_job_status(self.job_id, status, Some(exit_code), &[
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Canceled,
            ])
            .await?;
        Ok(())
    }

    fn blob_store(&self) -> Arc<dyn BlobStore> {
        self.blob_store_handle.clone()
    }
}

/// Creates and attaches sandbox sessions for a run.
#[derive(Clone)]
pub struct SandboxSessionManager {
    backend: Arc<dyn SandboxBackend>,
    allowlist: Arc<dyn SandboxAllowlist>,
    store: Arc<dyn RunStore>,
    blob_store: Arc<dyn BlobStore>,
}

impl SandboxSessionManager {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        allowlist: Arc<dyn SandboxAllowlist>,
        store: Arc<dyn RunStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            backend,
            allowlist,
            store,
            blob_store,
        }
    }

    /// Starts a new sandbox, persists a `pending` `SandboxJob` row, and
    /// returns a session bound to it. The job transitions to `running`
    /// on the first `run_command` call, not here.
    pub async fn start_session(
        &self,
        run_id: RunId,
        project_id: &str,
        job_type: &str,
        step_id: Option<StepId>,
        network_policy: NetworkPolicy,
    ) -> Result<SandboxSession> {
        let mut job = SandboxJob::new(run_id, project_id, job_type);
        job.step_id = step_id;
        let job_id = job.id;
        self.store.create_sandbox_job(job).await?;

        let sandbox_id = self.backend.create(project_id, network_policy).await?;

        Ok(SandboxSession {
            run_id,
            job_id,
            sandbox_id,
            stop_on_finalize: false,
            backend: self.backend.clone(),
            allowlist: self.allowlist.clone(),
            store: self.store.clone(),
            network_policy,
            transcript: Mutex::new(TranscriptBuffer::new(TRANSCRIPT_CAP_CHARS)),
            finalized: Mutex::new(false),
            blob_store_handle: self.blob_store.clone(),
        })
    }

    /// Rebinds an existing sandbox by its job id, for steps that resume
    /// a session started by an earlier step.
    pub async fn attach_session(
        &self,
        run_id: RunId,
        job_id: SandboxJobId,
        sandbox_id: String,
        stop_on_finalize: bool,
    ) -> Result<SandboxSession> {
        let job = self.store.get_sandbox_job(job_id).await?;
        if job.run_id != run_id {
            return Err(OrchestratorError::not_found(
                "sandbox job does not belong to this run",
            ));
        }
        Ok(SandboxSession {
            run_id,
            job_id,
            sandbox_id,
            stop_on_finalize,
            backend: self.backend.clone(),
            allowlist: self.allowlist.clone(),
            store: self.store.clone(),
            network_policy: NetworkPolicy::AllowlistOnly,
            transcript: Mutex::new(TranscriptBuffer::new(TRANSCRIPT_CAP_CHARS)),
            finalized: Mutex::new(false),
            blob_store_handle: self.blob_store.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::FilesystemBlobStore;
    use crate::storage::run_store::RedbRunStore;
    use crate::types::{BlobHash, RunKind};
    use serde_json::json;
    use tempfile::TempDir;

    struct FakeBackend;

    #[async_trait::async_trait]
    impl SandboxBackend for FakeBackend {
        async fn create(&self, _project_id: &str, _policy: NetworkPolicy) -> Result<String> {
            Ok("sandbox-1".to_string())
        }
        async fn exec(&self, _sandbox_id: &str, cmd: &CommandRequest) -> Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: 0,
                stdout: format!("ran {}\n", cmd.cmd),
                stderr: String::new(),
            })
        }
        async fn stop(&self, _sandbox_id: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn manager() -> (SandboxSessionManager, RunId, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> =
            Arc::new(RedbRunStore::new(dir.path().join("runs.redb")).unwrap());
        let blob: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::new(dir.path().join("blobs")).unwrap());
        let allowlist: Arc<dyn SandboxAllowlist> = Arc::new(CommandAllowlist::new(["git", "ls"]));
        let run_id = store
            .create_run("proj", RunKind::Implementation, json!({}))
            .await
            .unwrap();
        (
            SandboxSessionManager::new(Arc::new(FakeBackend), allowlist, store, blob),
            run_id,
            dir,
        )
    }

    #[tokio::test]
    async fn disallowed_command_is_rejected_before_exec() {
        let (mgr, run_id, _dir) = manager().await;
        let session = mgr
            .start_session(run_id, "proj", "checkout", None, NetworkPolicy::None)
            .await
            .unwrap();

        let err = session
            .run_command(CommandRequest {
                cmd: "rm".into(),
                args: vec!["-rf".into(), "/".into()],
                cwd: None,
                timeout: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn finalize_is_idempotent_and_blob_ref_write_once() {
        let (mgr, run_id, _dir) = manager().await;
        let session = mgr
            .start_session(run_id, "proj", "checkout", None, NetworkPolicy::None)
            .await
            .unwrap();
        session
            .run_command(CommandRequest {
                cmd: "git".into(),
                args: vec!["status".into()],
                cwd: None,
                timeout: None,
            })
            .await
            .unwrap();

        session.finalize(0, StepStatus::Succeeded).await.unwrap();
        session.finalize(1, StepStatus::Failed).await.unwrap(); // no-op

        let job = mgr.store.get_sandbox_job(session.job_id()).await.unwrap();
        assert_eq!(job.status, StepStatus::Succeeded);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.transcript_blob_ref.is_some());
    }

    /// A blob store whose `put` always fails, to exercise the finalize
    /// path's best-effort transcript persistence (spec §8 scenario 5).
    struct FailingBlobStore;

    #[async_trait::async_trait]
    impl BlobStore for FailingBlobStore {
        async fn put(&self, _data: Bytes) -> anyhow::Result<BlobHash> {
            anyhow::bail!("object store unreachable")
        }
        async fn get(&self, _hash: &BlobHash) -> anyhow::Result<Option<Bytes>> {
            Ok(None)
        }
        async fn exists(&self, _hash: &BlobHash) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn delete(&self, _hash: &BlobHash) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn finalize_survives_a_blob_store_failure() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> =
            Arc::new(RedbRunStore::new(dir.path().join("runs.redb")).unwrap());
        let blob: Arc<dyn BlobStore> = Arc::new(FailingBlobStore);
        let allowlist: Arc<dyn SandboxAllowlist> = Arc::new(CommandAllowlist::new(["git"]));
        let run_id = store
            .create_run("proj", RunKind::Implementation, json!({}))
            .await
            .unwrap();
        let mgr = SandboxSessionManager::new(Arc::new(FakeBackend), allowlist, store.clone(), blob);

        let session = mgr
            .start_session(run_id, "proj", "checkout", None, NetworkPolicy::None)
            .await
            .unwrap();
        session
            .run_command(CommandRequest {
                cmd: "git".into(),
                args: vec!["status".into()],
                cwd: None,
                timeout: None,
            })
            .await
            .unwrap();

        // finalize must still succeed even though the blob write failed.
        session.finalize(0, StepStatus::Succeeded).await.unwrap();

        let job = store.get_sandbox_job(session.job_id()).await.unwrap();
        assert_eq!(job.status, StepStatus::Succeeded);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.transcript_blob_ref.is_none());
    }

    #[tokio::test]
    async fn transcript_truncates_at_cap() {
        let (mgr, run_id, _dir) = manager().await;
        let session = mgr
            .start_session(run_id, "proj", "checkout", None, NetworkPolicy::None)
            .await
            .unwrap();
        {
            let mut t = session.transcript.lock().await;
            t.cap = 10;
            t.append("0123456789ABCDEF");
        }
        assert!(session.transcript_truncated().await);
    }
}
