//! The Run Store (spec §4.A): transactional primitives over runs, steps,
//! approvals and sandbox jobs. This is the only layer that touches redb;
//! everything above it (`step_service`, `approval`, `sandbox`) enforces
//! the state machine on top of these guarded primitives.

use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::types::{
    Approval, ApprovalId, ApprovalStatus, BlobHash, Run, RunId, RunKind, RunStatus, SandboxJob,
    SandboxJobId, Step, StepId, StepKind, StepPatch, StepStatus,
};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const STEPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("run_steps");
const APPROVALS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("approvals");
const SANDBOX_JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sandbox_jobs");

fn step_key(run_id: RunId, step_id: &StepId) -> String {
    format!("{run_id}:{}", step_id.0)
}

fn approval_key(run_id: RunId, scope: &str) -> String {
    format!("{run_id}:{scope}")
}

/// Transactional store for runs, steps, approvals and sandbox jobs.
/// Reads are snapshot-consistent within a single call; writes other than
/// `cancel_run_and_steps_tx` rely on row-level preconditions rather than
/// serializable transactions (spec §9 design note).
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, project_id: &str, kind: RunKind, metadata: Value) -> Result<RunId>;
    async fn get_run(&self, run_id: RunId) -> Result<Run>;
    async fn attach_workflow_run(&self, run_id: RunId, workflow_run_id: &str) -> Result<()>;
    async fn update_run_status(
        &self,
        run_id: RunId,
        next: RunStatus,
        precondition_status_not_in: &[RunStatus],
    ) -> Result<bool>;

    async fn insert_step_if_absent(
        &self,
        run_id: RunId,
        step_id: StepId,
        step_kind: StepKind,
        step_name: &str,
        inputs: Value,
    ) -> Result<()>;
    async fn get_step(&self, run_id: RunId, step_id: &StepId) -> Result<Step>;
    async fn update_step(
        &self,
        run_id: RunId,
        step_id: &StepId,
        patch: StepPatch,
        precondition_status_not_in: &[StepStatus],
    ) -> Result<bool>;

    async fn cancel_run_and_steps_tx(&self, run_id: RunId) -> Result<()>;

    async fn create_approval_if_absent(
        &self,
        run_id: RunId,
        project_id: &str,
        step_id: Option<StepId>,
        scope: &str,
        intent_summary: &str,
        metadata: Value,
    ) -> Result<Approval>;
    async fn get_approval(&self, run_id: RunId, scope: &str) -> Result<Option<Approval>>;
    async fn resolve_approval(
        &self,
        run_id: RunId,
        scope: &str,
        status: ApprovalStatus,
        approved_by: &str,
    ) -> Result<Approval>;

    async fn create_sandbox_job(&self, job: SandboxJob) -> Result<()>;
    async fn get_sandbox_job(&self, job_id: SandboxJobId) -> Result<SandboxJob>;
    async fn update_sandbox_job_status(
        &self,
        job_id: SandboxJobId,
        next: StepStatus,
        exit_code: Option<i32>,
        precondition_status_not_in: &[StepStatus],
    ) -> Result<bool>;
    /// Write-once: a no-op if `transcript_blob_ref` is already set (spec
    /// invariant 5).
    async fn set_transcript_blob_ref(&self, job_id: SandboxJobId, blob: BlobHash) -> Result<bool>;
}

/// `redb`-backed implementation. One `Database` handle shared across
/// tasks; each operation opens its own transaction, matching the
/// teacher's `RedbIndexStore` idiom.
#[derive(Clone)]
pub struct RedbRunStore {
    db: Arc<Database>,
}

impl RedbRunStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OrchestratorError::env_invalid("Failed to create storage directory").with_cause(e))?;
        }

        let db = Database::create(&path)
            .map_err(|e| OrchestratorError::new(ErrorCode::DbNotMigrated, "Failed to open run store").with_cause(e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| OrchestratorError::db_insert_failed(e))?;
        {
            let _ = write_txn.open_table(RUNS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
            let _ = write_txn.open_table(STEPS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
            let _ = write_txn.open_table(APPROVALS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
            let _ = write_txn.open_table(SANDBOX_JOBS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
        }
        write_txn.commit().map_err(OrchestratorError::db_insert_failed)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_run(&self, run_id: RunId) -> Result<Run> {
        let txn = self.db.begin_read().map_err(OrchestratorError::db_update_failed)?;
        let table = txn.open_table(RUNS_TABLE).map_err(OrchestratorError::db_update_failed)?;
        let key = run_id.to_string();
        let bytes = table
            .get(key.as_str())
            .map_err(OrchestratorError::db_update_failed)?
            .ok_or_else(|| OrchestratorError::not_found(format!("run {run_id} not found")))?;
        serde_json::from_slice(bytes.value()).map_err(|e| OrchestratorError::db_update_failed(e))
    }
}

#[async_trait::async_trait]
impl RunStore for RedbRunStore {
    async fn create_run(&self, project_id: &str, kind: RunKind, metadata: Value) -> Result<RunId> {
        let run = Run::new(project_id, kind, metadata);
        let id = run.id;
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_insert_failed)?;
        {
            let mut table = write_txn.open_table(RUNS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
            let key = id.to_string();
            let value = serde_json::to_vec(&run).map_err(OrchestratorError::db_insert_failed)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(OrchestratorError::db_insert_failed)?;
        }
        write_txn.commit().map_err(OrchestratorError::db_insert_failed)?;
        Ok(id)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.read_run(run_id)
    }

    async fn attach_workflow_run(&self, run_id: RunId, workflow_run_id: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_update_failed)?;
        {
            let mut table = write_txn.open_table(RUNS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let key = run_id.to_string();
            let bytes = table
                .get(key.as_str())
                .map_err(OrchestratorError::db_update_failed)?
                .ok_or_else(|| OrchestratorError::not_found(format!("run {run_id} not found")))?
                .value()
                .to_vec();
            let mut run: Run = serde_json::from_slice(&bytes).map_err(OrchestratorError::db_update_failed)?;

            match &run.workflow_run_id {
                Some(existing) if existing != workflow_run_id => {
                    return Err(OrchestratorError::conflict(format!(
                        "run {run_id} already has workflow_run_id {existing}"
                    )));
                }
                Some(_) => return Ok(()), // invariant 4: set at most once; same value is a no-op
                None => {}
            }

            run.workflow_run_id = Some(workflow_run_id.to_string());
            run.updated_at = Utc::now();
            let value = serde_json::to_vec(&run).map_err(OrchestratorError::db_update_failed)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(OrchestratorError::db_update_failed)?;
        }
        write_txn.commit().map_err(OrchestratorError::db_update_failed)?;
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        next: RunStatus,
        precondition_status_not_in: &[RunStatus],
    ) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_update_failed)?;
        let applied;
        {
            let mut table = write_txn.open_table(RUNS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let key = run_id.to_string();
            let bytes = table
                .get(key.as_str())
                .map_err(OrchestratorError::db_update_failed)?
                .ok_or_else(|| OrchestratorError::not_found(format!("run {run_id} not found")))?
                .value()
                .to_vec();
            let mut run: Run = serde_json::from_slice(&bytes).map_err(OrchestratorError::db_update_failed)?;

            if precondition_status_not_in.contains(&run.status) {
                applied = false;
            } else {
                run.status = next;
                run.updated_at = Utc::now();
                let value = serde_json::to_vec(&run).map_err(OrchestratorError::db_update_failed)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_update_failed)?;
                applied = true;
            }
        }
        write_txn.commit().map_err(OrchestratorError::db_update_failed)?;
        Ok(applied)
    }

    async fn insert_step_if_absent(
        &self,
        run_id: RunId,
        step_id: StepId,
        step_kind: StepKind,
        step_name: &str,
        inputs: Value,
    ) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_insert_failed)?;
        {
            let mut table = write_txn.open_table(STEPS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
            let key = step_key(run_id, &step_id);
            if table.get(key.as_str()).map_err(OrchestratorError::db_insert_failed)?.is_some() {
                return Ok(()); // idempotent: no row is ever overwritten by this call
            }
            let step = Step::new(run_id, step_id, step_kind, step_name, inputs);
            let value = serde_json::to_vec(&step).map_err(OrchestratorError::db_insert_failed)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(OrchestratorError::db_insert_failed)?;
        }
        write_txn.commit().map_err(OrchestratorError::db_insert_failed)?;
        Ok(())
    }

    async fn get_step(&self, run_id: RunId, step_id: &StepId) -> Result<Step> {
        let txn = self.db.begin_read().map_err(OrchestratorError::db_update_failed)?;
        let table = txn.open_table(STEPS_TABLE).map_err(OrchestratorError::db_update_failed)?;
        let key = step_key(run_id, step_id);
        let bytes = table
            .get(key.as_str())
            .map_err(OrchestratorError::db_update_failed)?
            .ok_or_else(|| OrchestratorError::not_found(format!("step {step_id} not found on run {run_id}")))?;
        serde_json::from_slice(bytes.value()).map_err(|e| OrchestratorError::db_update_failed(e))
    }

    async fn update_step(
        &self,
        run_id: RunId,
        step_id: &StepId,
        patch: StepPatch,
        precondition_status_not_in: &[StepStatus],
    ) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_update_failed)?;
        let applied;
        {
            let mut table = write_txn.open_table(STEPS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let key = step_key(run_id, step_id);
            let bytes = table
                .get(key.as_str())
                .map_err(OrchestratorError::db_update_failed)?
                .ok_or_else(|| OrchestratorError::not_found(format!("step {step_id} not found on run {run_id}")))?
                .value()
                .to_vec();
            let mut step: Step = serde_json::from_slice(&bytes).map_err(OrchestratorError::db_update_failed)?;

            if precondition_status_not_in.contains(&step.status) {
                applied = false;
            } else {
                if let Some(status) = patch.status {
                    step.status = status;
                }
                if let Some(attempt) = patch.attempt {
                    step.attempt = attempt;
                }
                if let Some(outputs) = patch.outputs {
                    step.outputs = Some(outputs);
                }
                if let Some(error) = patch.error {
                    step.error = Some(error);
                }
                if let Some(started_at) = patch.started_at {
                    step.started_at = started_at;
                }
                if let Some(ended_at) = patch.ended_at {
                    step.ended_at = ended_at;
                }
                step.updated_at = Utc::now();
                let value = serde_json::to_vec(&step).map_err(OrchestratorError::db_update_failed)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_update_failed)?;
                applied = true;
            }
        }
        write_txn.commit().map_err(OrchestratorError::db_update_failed)?;
        Ok(applied)
    }

    async fn cancel_run_and_steps_tx(&self, run_id: RunId) -> Result<()> {
        let now = Utc::now();
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_update_failed)?;
        {
            let mut runs = write_txn.open_table(RUNS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let run_key = run_id.to_string();
            let run_bytes = runs
                .get(run_key.as_str())
                .map_err(OrchestratorError::db_update_failed)?
                .ok_or_else(|| OrchestratorError::not_found(format!("run {run_id} not found")))?
                .value()
                .to_vec();
            let mut run: Run = serde_json::from_slice(&run_bytes).map_err(OrchestratorError::db_update_failed)?;
            if !run.status.is_terminal() {
                run.status = RunStatus::Canceled;
                run.updated_at = now;
                let value = serde_json::to_vec(&run).map_err(OrchestratorError::db_update_failed)?;
                runs.insert(run_key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_update_failed)?;
            }
        }
        {
            let mut steps = write_txn.open_table(STEPS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let prefix = format!("{run_id}:");
            let mut to_update = Vec::new();
            for item in steps.iter().map_err(OrchestratorError::db_update_failed)? {
                let (key, value) = item.map_err(OrchestratorError::db_update_failed)?;
                if key.value().starts_with(&prefix) {
                    let mut step: Step = serde_json::from_slice(value.value()).map_err(OrchestratorError::db_update_failed)?;
                    if !step.status.is_terminal() {
                        step.status = StepStatus::Canceled;
                        step.ended_at = Some(now);
                        step.updated_at = now;
                        to_update.push((key.value().to_string(), step));
                    }
                }
            }
            for (key, step) in to_update {
                let value = serde_json::to_vec(&step).map_err(OrchestratorError::db_update_failed)?;
                steps
                    .insert(key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_update_failed)?;
            }
        }
        write_txn.commit().map_err(OrchestratorError::db_update_failed)?;
        Ok(())
    }

    async fn create_approval_if_absent(
        &self,
        run_id: RunId,
        project_id: &str,
        step_id: Option<StepId>,
        scope: &str,
        intent_summary: &str,
        metadata: Value,
    ) -> Result<Approval> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_insert_failed)?;
        let approval;
        {
            let mut table = write_txn.open_table(APPROVALS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
            let key = approval_key(run_id, scope);
            if let Some(existing) = table.get(key.as_str()).map_err(OrchestratorError::db_insert_failed)? {
                approval = serde_json::from_slice(existing.value()).map_err(OrchestratorError::db_insert_failed)?;
            } else {
                let new_approval = Approval {
                    id: ApprovalId::new(),
                    run_id,
                    project_id: project_id.to_string(),
                    step_id,
                    scope: scope.to_string(),
                    intent_summary: intent_summary.to_string(),
                    status: ApprovalStatus::Pending,
                    approved_by: None,
                    approved_at: None,
                    metadata,
                    created_at: Utc::now(),
                };
                let value = serde_json::to_vec(&new_approval).map_err(OrchestratorError::db_insert_failed)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_insert_failed)?;
                approval = new_approval;
            }
        }
        write_txn.commit().map_err(OrchestratorError::db_insert_failed)?;
        Ok(approval)
    }

    async fn get_approval(&self, run_id: RunId, scope: &str) -> Result<Option<Approval>> {
        let txn = self.db.begin_read().map_err(OrchestratorError::db_update_failed)?;
        let table = txn.open_table(APPROVALS_TABLE).map_err(OrchestratorError::db_update_failed)?;
        let key = approval_key(run_id, scope);
        match table.get(key.as_str()).map_err(OrchestratorError::db_update_failed)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(bytes.value()).map_err(OrchestratorError::db_update_failed)?,
            )),
            None => Ok(None),
        }
    }

    async fn resolve_approval(
        &self,
        run_id: RunId,
        scope: &str,
        status: ApprovalStatus,
        approved_by: &str,
    ) -> Result<Approval> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_update_failed)?;
        let approval;
        {
            let mut table = write_txn.open_table(APPROVALS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let key = approval_key(run_id, scope);
            let bytes = table
                .get(key.as_str())
                .map_err(OrchestratorError::db_update_failed)?
                .ok_or_else(|| OrchestratorError::not_found(format!("approval {scope} not found on run {run_id}")))?
                .value()
                .to_vec();
            let mut existing: Approval = serde_json::from_slice(&bytes).map_err(OrchestratorError::db_update_failed)?;
            if existing.status == ApprovalStatus::Pending {
                existing.status = status;
                existing.approved_by = Some(approved_by.to_string());
                existing.approved_at = Some(Utc::now());
                let value = serde_json::to_vec(&existing).map_err(OrchestratorError::db_update_failed)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_update_failed)?;
            }
            approval = existing;
        }
        write_txn.commit().map_err(OrchestratorError::db_update_failed)?;
        Ok(approval)
    }

    async fn create_sandbox_job(&self, job: SandboxJob) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_insert_failed)?;
        {
            let mut table = write_txn.open_table(SANDBOX_JOBS_TABLE).map_err(OrchestratorError::db_insert_failed)?;
            let key = format!("{}:{}", job.run_id, job.id.0);
            let value = serde_json::to_vec(&job).map_err(OrchestratorError::db_insert_failed)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(OrchestratorError::db_insert_failed)?;
        }
        write_txn.commit().map_err(OrchestratorError::db_insert_failed)?;
        Ok(())
    }

    async fn get_sandbox_job(&self, job_id: SandboxJobId) -> Result<SandboxJob> {
        let txn = self.db.begin_read().map_err(OrchestratorError::db_update_failed)?;
        let table = txn.open_table(SANDBOX_JOBS_TABLE).map_err(OrchestratorError::db_update_failed)?;
        for item in table.iter().map_err(OrchestratorError::db_update_failed)? {
            let (_key, value) = item.map_err(OrchestratorError::db_update_failed)?;
            let job: SandboxJob = serde_json::from_slice(value.value()).map_err(OrchestratorError::db_update_failed)?;
            if job.id == job_id {
                return Ok(job);
            }
        }
        Err(OrchestratorError::not_found(format!("sandbox job {} not found", job_id.0)))
    }

    async fn update_sandbox_job_status(
        &self,
        job_id: SandboxJobId,
        next: StepStatus,
        exit_code: Option<i32>,
        precondition_status_not_in: &[StepStatus],
    ) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_update_failed)?;
        let applied;
        {
            let mut table = write_txn.open_table(SANDBOX_JOBS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let mut found_key = None;
            let mut found_job = None;
            for item in table.iter().map_err(OrchestratorError::db_update_failed)? {
                let (key, value) = item.map_err(OrchestratorError::db_update_failed)?;
                let job: SandboxJob = serde_json::from_slice(value.value()).map_err(OrchestratorError::db_update_failed)?;
                if job.id == job_id {
                    found_key = Some(key.value().to_string());
                    found_job = Some(job);
                    break;
                }
            }
            let key = found_key.ok_or_else(|| OrchestratorError::not_found(format!("sandbox job {} not found", job_id.0)))?;
            let mut job = found_job.unwrap();

            if precondition_status_not_in.contains(&job.status) {
                applied = false;
            } else {
                job.status = next;
                if exit_code.is_some() {
                    job.exit_code = exit_code;
                }
                if next.is_terminal() {
                    job.ended_at = Some(Utc::now());
                }
                job.updated_at = Utc::now();
                let value = serde_json::to_vec(&job).map_err(OrchestratorError::db_update_failed)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_update_failed)?;
                applied = true;
            }
        }
        write_txn.commit().map_err(OrchestratorError::db_update_failed)?;
        Ok(applied)
    }

    async fn set_transcript_blob_ref(&self, job_id: SandboxJobId, blob: BlobHash) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(OrchestratorError::db_update_failed)?;
        let applied;
        {
            let mut table = write_txn.open_table(SANDBOX_JOBS_TABLE).map_err(OrchestratorError::db_update_failed)?;
            let mut found_key = None;
            let mut found_job = None;
            for item in table.iter().map_err(OrchestratorError::db_update_failed)? {
                let (key, value) = item.map_err(OrchestratorError::db_update_failed)?;
                let job: SandboxJob = serde_json::from_slice(value.value()).map_err(OrchestratorError::db_update_failed)?;
                if job.id == job_id {
                    found_key = Some(key.value().to_string());
                    found_job = Some(job);
                    break;
                }
            }
            let key = found_key.ok_or_else(|| OrchestratorError::not_found(format!("sandbox job {} not found", job_id.0)))?;
            let mut job = found_job.unwrap();

            if job.transcript_blob_ref.is_some() {
                applied = false; // invariant 5: write-once
            } else {
                job.transcript_blob_ref = Some(blob);
                job.updated_at = Utc::now();
                let value = serde_json::to_vec(&job).map_err(OrchestratorError::db_update_failed)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(OrchestratorError::db_update_failed)?;
                applied = true;
            }
        }
        write_txn.commit().map_err(OrchestratorError::db_update_failed)?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (RedbRunStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RedbRunStore::new(dir.path().join("runs.redb")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn create_and_get_run() {
        let (store, _dir) = store();
        let id = store.create_run("proj", RunKind::Research, json!({})).await.unwrap();
        let run = store.get_run(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.project_id, "proj");
    }

    #[tokio::test]
    async fn attach_workflow_run_rejects_rebind() {
        let (store, _dir) = store();
        let id = store.create_run("proj", RunKind::Research, json!({})).await.unwrap();
        store.attach_workflow_run(id, "w1").await.unwrap();
        store.attach_workflow_run(id, "w1").await.unwrap(); // same value: no-op, not an error
        let err = store.attach_workflow_run(id, "w2").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn insert_step_if_absent_never_overwrites() {
        let (store, _dir) = store();
        let run_id = store.create_run("proj", RunKind::Research, json!({})).await.unwrap();
        let step_id = StepId::new("gather");
        store
            .insert_step_if_absent(run_id, step_id.clone(), StepKind::Tool, "Gather", json!({}))
            .await
            .unwrap();
        store
            .update_step(
                run_id,
                &step_id,
                StepPatch {
                    status: Some(StepStatus::Running),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap();
        store
            .insert_step_if_absent(run_id, step_id.clone(), StepKind::Tool, "Gather", json!({}))
            .await
            .unwrap();
        let step = store.get_step(run_id, &step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Running);
    }

    #[tokio::test]
    async fn cancel_run_and_steps_skips_terminal_rows() {
        let (store, _dir) = store();
        let run_id = store.create_run("proj", RunKind::Research, json!({})).await.unwrap();
        let a = StepId::new("a");
        let b = StepId::new("b");
        store.insert_step_if_absent(run_id, a.clone(), StepKind::Tool, "A", json!({})).await.unwrap();
        store.insert_step_if_absent(run_id, b.clone(), StepKind::Tool, "B", json!({})).await.unwrap();
        store
            .update_step(run_id, &a, StepPatch { status: Some(StepStatus::Succeeded), ..Default::default() }, &[])
            .await
            .unwrap();

        store.cancel_run_and_steps_tx(run_id).await.unwrap();

        let a_step = store.get_step(run_id, &a).await.unwrap();
        let b_step = store.get_step(run_id, &b).await.unwrap();
        assert_eq!(a_step.status, StepStatus::Succeeded); // untouched: already terminal
        assert_eq!(b_step.status, StepStatus::Canceled);
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn transcript_blob_ref_is_write_once() {
        let (store, _dir) = store();
        let run_id = store.create_run("proj", RunKind::Research, json!({})).await.unwrap();
        let job = SandboxJob::new(run_id, "proj", "checkout");
        let job_id = job.id;
        store.create_sandbox_job(job).await.unwrap();

        let first = store.set_transcript_blob_ref(job_id, BlobHash("aaa".into())).await.unwrap();
        let second = store.set_transcript_blob_ref(job_id, BlobHash("bbb".into())).await.unwrap();
        assert!(first);
        assert!(!second);
        let job = store.get_sandbox_job(job_id).await.unwrap();
        assert_eq!(job.transcript_blob_ref, Some(BlobHash("aaa".into())));
    }
}
