//! The Step Persistence Service (spec §4.B): enforces the Run & Step
//! State Machine on top of `RunStore`'s guarded primitives. No method
//! here ever takes a lock across an await outside the store itself —
//! correctness comes entirely from the store's per-row preconditions,
//! not from advisory locks (spec §9 design note).

use crate::error::Result;
use crate::storage::run_store::RunStore;
use crate::types::{RunId, RunStatus, Step, StepId, StepPatch, StepStatus};
use serde_json::{json, Value};
use std::sync::Arc;

/// Statuses from which a step/run may not re-enter `running` or be
/// finished again (spec invariant 1).
const TERMINAL_OR_RUNNING: &[StepStatus] = &[
    StepStatus::Running,
    StepStatus::Succeeded,
    StepStatus::Canceled,
];
const TERMINAL: &[StepStatus] = &[StepStatus::Succeeded, StepStatus::Failed, StepStatus::Canceled];

/// Wraps a `RunStore` and enforces the state machine in spec §4.B.
#[derive(Clone)]
pub struct StepService {
    store: Arc<dyn RunStore>,
}

impl StepService {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Idempotent row creation; delegates straight to the store, which
    /// already guarantees no row is ever overwritten.
    pub async fn ensure_step_row(
        &self,
        run_id: RunId,
        step_id: StepId,
        step_kind: crate::types::StepKind,
        step_name: &str,
        inputs: Value,
    ) -> Result<()> {
        self.store
            .insert_step_if_absent(run_id, step_id, step_kind, step_name, inputs)
            .await
    }

    pub async fn get_step(&self, run_id: RunId, step_id: &StepId) -> Result<Step> {
        self.store.get_step(run_id, step_id).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<crate::types::Run> {
        self.store.get_run(run_id).await
    }

    pub async fn attach_workflow_run(&self, run_id: RunId, workflow_run_id: &str) -> Result<()> {
        self.store.attach_workflow_run(run_id, workflow_run_id).await
    }

    /// `begin_step`: no-op when the step is already `running`,
    /// `succeeded`, or `canceled`; otherwise increments `attempt` and
    /// clears error/outputs (spec §4.B).
    pub async fn begin_step(&self, run_id: RunId, step_id: &StepId) -> Result<bool> {
        let current = self.store.get_step(run_id, step_id).await?;
        if TERMINAL_OR_RUNNING.contains(&current.status) {
            return Ok(false);
        }
        let patch = StepPatch {
            status: Some(StepStatus::Running),
            attempt: Some(current.attempt + 1),
            error: Some(Value::Null),
            outputs: Some(Value::Null),
            started_at: Some(Some(chrono::Utc::now())),
            ended_at: Some(None),
        };
        self.store
            .update_step(run_id, step_id, patch, TERMINAL_OR_RUNNING)
            .await
    }

    /// `finish_step`: no-op when already `succeeded` or `canceled`.
    /// `failed` without an explicit error gets the default payload from
    /// spec §4.B.
    pub async fn finish_step(
        &self,
        run_id: RunId,
        step_id: &StepId,
        terminal_status: StepStatus,
        outputs: Option<Value>,
        error: Option<Value>,
    ) -> Result<bool> {
        let no_op_from: &[StepStatus] = &[StepStatus::Succeeded, StepStatus::Canceled];
        let error = match terminal_status {
            StepStatus::Succeeded | StepStatus::Canceled => None,
            StepStatus::Failed => {
                Some(error.unwrap_or_else(|| json!({"message": "Failed."})))
            }
            _ => error,
        };
        let mut patch = StepPatch {
            status: Some(terminal_status),
            ended_at: Some(Some(chrono::Utc::now())),
            ..Default::default()
        };
        if let Some(outputs) = outputs {
            patch.outputs = Some(outputs);
        }
        if let Some(error) = error {
            patch.error = Some(error);
        }
        self.store
            .update_step(run_id, step_id, patch, no_op_from)
            .await
    }

    /// `mark_run_running`: only applies from a non-terminal status.
    pub async fn mark_run_running(&self, run_id: RunId) -> Result<bool> {
        self.store
            .update_run_status(run_id, RunStatus::Running, terminal_statuses())
            .await
    }

    /// `mark_run_terminal`: no-op on an already-terminal run (spec
    /// §4.B). This is the only place a run transitions to a terminal
    /// status outside of `cancel_run_and_steps`.
    pub async fn mark_run_terminal(&self, run_id: RunId, status: RunStatus) -> Result<bool> {
        debug_assert!(status.is_terminal());
        self.store
            .update_run_status(run_id, status, terminal_statuses())
            .await
    }

    /// Delegates to the store's transactional cancel, the atomic point
    /// that defeats terminal-status races (spec §4.A).
    pub async fn cancel_run_and_steps(&self, run_id: RunId) -> Result<()> {
        self.store.cancel_run_and_steps_tx(run_id).await
    }
}

fn terminal_statuses() -> &'static [RunStatus] {
    TERMINAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::run_store::RedbRunStore;
    use crate::types::{RunKind, StepKind};
    use serde_json::json;
    use tempfile::TempDir;

    async fn service() -> (StepService, Arc<dyn RunStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> =
            Arc::new(RedbRunStore::new(dir.path().join("runs.redb")).unwrap());
        (StepService::new(store.clone()), store, dir)
    }

    #[tokio::test]
    async fn begin_step_is_idempotent() {
        let (svc, store, _dir) = service().await;
        let run_id = store
            .create_run("proj", RunKind::Research, json!({}))
            .await
            .unwrap();
        let step_id = StepId::new("gather");
        svc.ensure_step_row(run_id, step_id.clone(), StepKind::Tool, "Gather", json!({}))
            .await
            .unwrap();

        assert!(svc.begin_step(run_id, &step_id).await.unwrap());
        let after_first = svc.get_step(run_id, &step_id).await.unwrap();
        assert_eq!(after_first.attempt, 1);

        // second begin_step is a no-op: attempt unchanged
        assert!(!svc.begin_step(run_id, &step_id).await.unwrap());
        let after_second = svc.get_step(run_id, &step_id).await.unwrap();
        assert_eq!(after_second.attempt, 1);
    }

    #[tokio::test]
    async fn finish_succeeded_then_failed_is_no_op() {
        let (svc, store, _dir) = service().await;
        let run_id = store
            .create_run("proj", RunKind::Research, json!({}))
            .await
            .unwrap();
        let step_id = StepId::new("gather");
        svc.ensure_step_row(run_id, step_id.clone(), StepKind::Tool, "Gather", json!({}))
            .await
            .unwrap();
        svc.begin_step(run_id, &step_id).await.unwrap();

        assert!(svc
            .finish_step(run_id, &step_id, StepStatus::Succeeded, None, None)
            .await
            .unwrap());
        assert!(!svc
            .finish_step(
                run_id,
                &step_id,
                StepStatus::Failed,
                None,
                Some(json!({"message": "too late"}))
            )
            .await
            .unwrap());

        let step = svc.get_step(run_id, &step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Succeeded);
        assert!(step.error.is_none());
    }

    #[tokio::test]
    async fn failed_step_without_error_gets_default_message() {
        let (svc, store, _dir) = service().await;
        let run_id = store
            .create_run("proj", RunKind::Research, json!({}))
            .await
            .unwrap();
        let step_id = StepId::new("plan");
        svc.ensure_step_row(run_id, step_id.clone(), StepKind::Llm, "Plan", json!({}))
            .await
            .unwrap();
        svc.begin_step(run_id, &step_id).await.unwrap();
        svc.finish_step(run_id, &step_id, StepStatus::Failed, None, None)
            .await
            .unwrap();

        let step = svc.get_step(run_id, &step_id).await.unwrap();
        assert_eq!(step.error, Some(json!({"message": "Failed."})));
    }

    #[tokio::test]
    async fn mark_run_terminal_is_no_op_once_terminal() {
        let (svc, store, _dir) = service().await;
        let run_id = store
            .create_run("proj", RunKind::Research, json!({}))
            .await
            .unwrap();
        svc.mark_run_running(run_id).await.unwrap();
        assert!(svc
            .mark_run_terminal(run_id, RunStatus::Succeeded)
            .await
            .unwrap());
        assert!(!svc
            .mark_run_terminal(run_id, RunStatus::Failed)
            .await
            .unwrap());

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    /// Spec §8 invariant 4: concurrent `mark_run_terminal(failed)` and
    /// `cancel_run_and_steps` must settle on exactly one terminal status,
    /// never both and never neither.
    #[tokio::test]
    async fn concurrent_fail_and_cancel_settle_on_one_terminal_status() {
        let (svc, store, _dir) = service().await;
        let run_id = store
            .create_run("proj", RunKind::Implementation, json!({}))
            .await
            .unwrap();
        svc.mark_run_running(run_id).await.unwrap();
        let step_id = StepId::new("sandbox-checkout");
        svc.ensure_step_row(run_id, step_id.clone(), StepKind::Sandbox, "Checkout", json!({}))
            .await
            .unwrap();
        svc.begin_step(run_id, &step_id).await.unwrap();

        let svc_a = svc.clone();
        let svc_b = svc.clone();
        let (fail_result, cancel_result) = tokio::join!(
            async move { svc_a.mark_run_terminal(run_id, RunStatus::Failed).await },
            async move { svc_b.cancel_run_and_steps(run_id).await },
        );
        fail_result.unwrap();
        cancel_result.unwrap();

        // redb serializes write transactions, so exactly one ordering
        // happened; either is an acceptable outcome, but it must be one
        // of the two, never a corrupted third state.
        let run = store.get_run(run_id).await.unwrap();
        assert!(matches!(run.status, RunStatus::Failed | RunStatus::Canceled));

        // `cancel_run_and_steps_tx` cancels every non-terminal step row
        // regardless of which transaction committed first, since
        // `mark_run_terminal` only ever touches the run row.
        let step = svc.get_step(run_id, &step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Canceled);
    }
}
