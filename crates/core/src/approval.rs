//! Minimal approval gate (spec §3 `Approval`, §4.A): a pending-until-approved
//! row scoped by `(run_id, scope)`. Requesting twice while pending is a
//! no-op; the row is idempotent by construction (`create_approval_if_absent`
//! in the run store).
//!
//! Approval-gated steps are modeled as rows polled from within a step body
//! rather than a distinct step-machine state (Open Question, resolved in
//! DESIGN.md): the orchestrator's `implementation` plan calls `request`
//! then awaits `resolve`/`get` from inside the `open-pr` step.

use crate::error::{OrchestratorError, Result};
use crate::storage::run_store::RunStore;
use crate::types::{Approval, ApprovalStatus, RunId, StepId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Requests and resolves scoped approvals for a run.
#[derive(Clone)]
pub struct ApprovalService {
    store: Arc<dyn RunStore>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Idempotent while pending: a second `request` for the same scope
    /// returns the existing row rather than creating another.
    pub async fn request(
        &self,
        run_id: RunId,
        project_id: &str,
        step_id: Option<StepId>,
        scope: &str,
        intent_summary: &str,
        metadata: Value,
    ) -> Result<Approval> {
        self.store
            .create_approval_if_absent(run_id, project_id, step_id, scope, intent_summary, metadata)
            .await
    }

    pub async fn get(&self, run_id: RunId, scope: &str) -> Result<Option<Approval>> {
        self.store.get_approval(run_id, scope).await
    }

    pub async fn resolve(
        &self,
        run_id: RunId,
        scope: &str,
        status: ApprovalStatus,
        approved_by: &str,
    ) -> Result<Approval> {
        if status == ApprovalStatus::Pending {
            return Err(OrchestratorError::bad_request(
                "cannot resolve an approval to the pending status",
            ));
        }
        self.store.resolve_approval(run_id, scope, status, approved_by).await
    }

    /// Polls `get` until the approval leaves `pending`, honoring a
    /// cancellation token so the orchestrator's cancellation path is
    /// never blocked on a human who never shows up. Every external wait
    /// in this system is interruptible and has a bound (spec §5).
    pub async fn await_resolution(
        &self,
        run_id: RunId,
        scope: &str,
        cancel: &tokio_util::sync::CancellationToken,
        poll_interval: Duration,
    ) -> Result<Approval> {
        loop {
            if let Some(approval) = self.get(run_id, scope).await? {
                if approval.status != ApprovalStatus::Pending {
                    return Ok(approval);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::new(
                        crate::error::ErrorCode::Conflict,
                        "run canceled while awaiting approval",
                    ));
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::run_store::RedbRunStore;
    use crate::types::RunKind;
    use serde_json::json;
    use tempfile::TempDir;

    async fn service() -> (ApprovalService, RunId, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> =
            Arc::new(RedbRunStore::new(dir.path().join("runs.redb")).unwrap());
        let run_id = store
            .create_run("proj", RunKind::Implementation, json!({}))
            .await
            .unwrap();
        (ApprovalService::new(store), run_id, dir)
    }

    #[tokio::test]
    async fn request_while_pending_is_idempotent() {
        let (svc, run_id, _dir) = service().await;
        let a = svc
            .request(run_id, "proj", None, "repo.merge", "merge PR #1", json!({}))
            .await
            .unwrap();
        let b = svc
            .request(run_id, "proj", None, "repo.merge", "merge PR #1 (again)", json!({}))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.intent_summary, "merge PR #1"); // first write wins
    }

    #[tokio::test]
    async fn resolve_to_pending_is_rejected() {
        let (svc, run_id, _dir) = service().await;
        svc.request(run_id, "proj", None, "repo.merge", "merge", json!({}))
            .await
            .unwrap();
        let err = svc
            .resolve(run_id, "repo.merge", ApprovalStatus::Pending, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn await_resolution_returns_once_approved() {
        let (svc, run_id, _dir) = service().await;
        svc.request(run_id, "proj", None, "repo.merge", "merge", json!({}))
            .await
            .unwrap();
        svc.resolve(run_id, "repo.merge", ApprovalStatus::Approved, "alice")
            .await
            .unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let approval = svc
            .await_resolution(run_id, "repo.merge", &cancel, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
    }
}
