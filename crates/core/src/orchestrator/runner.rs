//! The orchestrator driver: loads run state, drives the static plan for
//! a run's `kind` step by step, and classifies every exit into exactly
//! one of succeeded/failed/canceled (spec §4.F).
//!
//! Cancellation idiom grounded on `workflow/executor.rs`'s
//! `WorkflowExecutor` + `watch::Sender<bool>` cancellation channel,
//! generalized here to `tokio_util::sync::CancellationToken` so it
//! composes with `tokio::select!` at every suspension point.

use crate::error::{OrchestratorError, Result};
use crate::events::EventPayload;
use crate::sandbox::SandboxSessionManager;
use crate::storage::event_log::EventLog;
use crate::step_service::StepService;
use crate::approval::ApprovalService;
use crate::types::{RunId, RunKind, RunStatus, StepId, StepKind, StepStatus};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a step body needs: identity, its own cancellation view,
/// and handles to emit fine-grained events and run sandbox commands.
pub struct StepContext {
    pub run_id: RunId,
    pub project_id: String,
    pub step_id: StepId,
    pub cancel: CancellationToken,
    pub events: Arc<EventLog>,
    pub sandbox: Arc<SandboxSessionManager>,
    pub approvals: Arc<ApprovalService>,
}

impl StepContext {
    pub async fn log(&self, data: impl Into<String>) -> Result<u64> {
        self.events
            .emit(self.run_id, EventPayload::Log { data: data.into() })
            .await
    }

    pub async fn status(&self, message: impl Into<String>) -> Result<u64> {
        self.events
            .emit(
                self.run_id,
                EventPayload::Status {
                    message: message.into(),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await
    }

    pub async fn assistant_delta(&self, text_delta: impl Into<String>) -> Result<u64> {
        self.events
            .emit(self.run_id, EventPayload::AssistantDelta { text_delta: text_delta.into() })
            .await
    }

    pub async fn tool_call(&self, tool_name: impl Into<String>, input: Value) -> Result<u64> {
        self.events
            .emit(self.run_id, EventPayload::ToolCall { tool_name: tool_name.into(), input })
            .await
    }

    pub async fn tool_result(&self, tool_name: impl Into<String>, output: Value) -> Result<u64> {
        self.events
            .emit(
                self.run_id,
                EventPayload::ToolResult {
                    tool_name: tool_name.into(),
                    output,
                    truncated: None,
                },
            )
            .await
    }
}

/// A step body. Mirrors spec §9's `(ctx, run_id) -> Result<Outputs, Error>`
/// model; `Arc<dyn StepHandler>` lets plans share handlers and lets tests
/// substitute fakes.
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<Value>;
}

/// Wraps a boxed async closure as a `StepHandler`, for plans that don't
/// need a dedicated type.
pub struct FnStepHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> StepHandler for FnStepHandler<F>
where
    F: Fn(&StepContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        (self.0)(ctx).await
    }
}

/// One entry in a workflow kind's static plan.
pub struct StepPlan {
    pub step_id: StepId,
    pub step_kind: StepKind,
    pub step_name: &'static str,
    pub handler: Arc<dyn StepHandler>,
}

/// Shared dependencies plans close over when building their step list.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub sandbox: Arc<SandboxSessionManager>,
    pub approvals: Arc<ApprovalService>,
}

/// Obtains the `workflow_run_id` from the external executor and exposes
/// the cancellation predicate the Orchestrator polls at each step
/// boundary (spec §4.F, §5).
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn start(&self, run_id: RunId, kind: RunKind) -> Result<String>;
    fn is_canceled(&self, run_id: RunId) -> bool;
}

/// Classified terminal outcome of a run. Infra-level persistence
/// failures (e.g. the store itself being unreachable) surface as `Err`
/// from `run()`, not as a variant here — this enum is strictly the
/// business classification from spec §4.F / §7.
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded,
    Failed(OrchestratorError),
    Canceled,
}

/// The per-workflow-kind driver (spec §4.F component F).
pub struct Orchestrator {
    steps: Arc<StepService>,
    events: Arc<EventLog>,
    executor: Arc<dyn Executor>,
    deps: OrchestratorDeps,
}

impl Orchestrator {
    pub fn new(
        steps: Arc<StepService>,
        events: Arc<EventLog>,
        executor: Arc<dyn Executor>,
        deps: OrchestratorDeps,
    ) -> Self {
        Self { steps, events, executor, deps }
    }

    /// Drives one run to completion. Returns `Ok(RunOutcome)` for every
    /// classified business outcome; returns `Err` only for a persistence
    /// error the orchestrator cannot recover a classification from (the
    /// run is left in whatever state the store last recorded).
    pub async fn run(
        &self,
        run_id: RunId,
        project_id: &str,
        kind: RunKind,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        if let Err(e) = self.start_run(run_id, kind).await {
            return self.finish_startup_failed(run_id, e).await;
        }

        let plan = plan_steps(kind, &self.deps);
        let mut active_step: Option<StepId> = None;

        for step in plan {
            if cancel.is_cancelled() || self.executor.is_canceled(run_id) {
                return self.finish_canceled(run_id, active_step.as_ref()).await;
            }

            self.steps
                .ensure_step_row(run_id, step.step_id.clone(), step.step_kind, step.step_name, Value::Null)
                .await?;
            self.steps.begin_step(run_id, &step.step_id).await?;
            active_step = Some(step.step_id.clone());
            self.events
                .emit(
                    run_id,
                    EventPayload::StepStarted {
                        step_id: step.step_id.clone(),
                        step_name: step.step_name.to_string(),
                    },
                )
                .await?;

            let ctx = StepContext {
                run_id,
                project_id: project_id.to_string(),
                step_id: step.step_id.clone(),
                cancel: cancel.clone(),
                events: self.events.clone(),
                sandbox: self.deps.sandbox.clone(),
                approvals: self.deps.approvals.clone(),
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = step.handler.execute(&ctx) => Some(result),
            };

            match outcome {
                None => return self.finish_canceled(run_id, Some(&step.step_id)).await,
                Some(Ok(outputs)) => {
                    self.steps
                        .finish_step(run_id, &step.step_id, StepStatus::Succeeded, Some(outputs.clone()), None)
                        .await?;
                    self.events
                        .emit(
                            run_id,
                            EventPayload::StepFinished {
                                step_id: step.step_id.clone(),
                                status: StepStatus::Succeeded,
                                outputs: Some(outputs),
                                error: None,
                            },
                        )
                        .await?;
                }
                Some(Err(e)) => return self.finish_failed(run_id, &step.step_id, e).await,
            }
        }

        self.steps.mark_run_terminal(run_id, RunStatus::Succeeded).await?;
        self.events
            .emit(run_id, EventPayload::RunFinished { status: RunStatus::Succeeded })
            .await?;
        self.close_best_effort(run_id).await;
        Ok(RunOutcome::Succeeded)
    }

    /// Obtains the `workflow_run_id`, attaches it, emits `run-started`, and
    /// marks the run running. Split out from `run()` so a failure at any
    /// point in this sequence — before a single step row exists — still
    /// routes through `finish_startup_failed` instead of leaving the run
    /// with no terminal event (Open Question 3, resolved in DESIGN.md).
    async fn start_run(&self, run_id: RunId, kind: RunKind) -> Result<()> {
        let workflow_run_id = self.executor.start(run_id, kind).await?;
        self.steps.attach_workflow_run(run_id, &workflow_run_id).await?;
        self.events
            .emit(
                run_id,
                EventPayload::RunStarted {
                    kind,
                    workflow_run_id,
                    timestamp: chrono::Utc::now(),
                },
            )
            .await?;
        self.steps.mark_run_running(run_id).await?;
        Ok(())
    }

    /// A run that failed before any step began (spec §4.F / §9 Open
    /// Question 3): no step row exists to fail, so this skips straight to
    /// marking the run terminal and emitting the synthetic `run-finished`
    /// every subscriber is guaranteed to see before `[DONE]`.
    async fn finish_startup_failed(&self, run_id: RunId, error: OrchestratorError) -> Result<RunOutcome> {
        self.steps.mark_run_terminal(run_id, RunStatus::Failed).await?;
        let _ = self
            .events
            .emit(run_id, EventPayload::RunFinished { status: RunStatus::Failed })
            .await;
        self.close_best_effort(run_id).await;
        Ok(RunOutcome::Failed(error))
    }

    /// Cancellation path (spec §4.F): finish the active step canceled,
    /// emit a final status event, cancel the rest of the run
    /// transactionally, close the stream, and re-raise cancellation —
    /// `mark_run_terminal(failed)` is never reachable from here.
    async fn finish_canceled(&self, run_id: RunId, active_step: Option<&StepId>) -> Result<RunOutcome> {
        if let Some(step_id) = active_step {
            // best-effort: the transactional cancel below is the actual
            // atomic point; this just gets the active step's status
            // updated promptly for anyone reading before it commits.
            let _ = self
                .steps
                .finish_step(run_id, step_id, StepStatus::Canceled, None, None)
                .await;
        }
        let _ = self
            .events
            .emit(
                run_id,
                EventPayload::Status {
                    message: "Run canceled.".to_string(),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await;
        self.steps.cancel_run_and_steps(run_id).await?;
        let _ = self
            .events
            .emit(run_id, EventPayload::RunFinished { status: RunStatus::Canceled })
            .await;
        self.close_best_effort(run_id).await;
        Ok(RunOutcome::Canceled)
    }

    /// Step failure path (spec §4.F / §7): finish the step failed with a
    /// user-safe message, mark the run terminal failed, emit the final
    /// status, close, and classify as `Failed`. Subsequent steps are
    /// never started because the caller returns immediately.
    async fn finish_failed(&self, run_id: RunId, step_id: &StepId, error: OrchestratorError) -> Result<RunOutcome> {
        let payload = serde_json::json!({ "message": error.message, "code": error.code.to_string() });
        self.steps
            .finish_step(run_id, step_id, StepStatus::Failed, None, Some(payload.clone()))
            .await?;
        self.events
            .emit(
                run_id,
                EventPayload::StepFinished {
                    step_id: step_id.clone(),
                    status: StepStatus::Failed,
                    outputs: None,
                    error: Some(payload),
                },
            )
            .await?;
        self.steps.mark_run_terminal(run_id, RunStatus::Failed).await?;
        let _ = self
            .events
            .emit(run_id, EventPayload::RunFinished { status: RunStatus::Failed })
            .await;
        self.close_best_effort(run_id).await;
        Ok(RunOutcome::Failed(error))
    }

    /// Closing the stream is a best-effort teardown step: it must never
    /// mask the classified outcome above it (spec §4.C/§7).
    async fn close_best_effort(&self, run_id: RunId) {
        if let Err(e) = self.events.close(run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to close event stream during teardown");
        }
    }
}

fn plan_steps(kind: RunKind, deps: &OrchestratorDeps) -> Vec<StepPlan> {
    super::plans::plan_for(kind)(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::FilesystemBlobStore;
    use crate::storage::run_store::RedbRunStore;
    use crate::sandbox::{CommandAllowlist, CommandOutput, CommandRequest, NetworkPolicy, SandboxAllowlist, SandboxBackend};
    use crate::storage::run_store::RunStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct FakeExecutor {
        canceled: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Executor for FakeExecutor {
        async fn start(&self, _run_id: RunId, _kind: RunKind) -> Result<String> {
            Ok("wf-1".to_string())
        }
        fn is_canceled(&self, _run_id: RunId) -> bool {
            self.canceled.load(Ordering::SeqCst)
        }
    }

    struct FakeSandboxBackend;
    #[async_trait::async_trait]
    impl SandboxBackend for FakeSandboxBackend {
        async fn create(&self, _project_id: &str, _policy: NetworkPolicy) -> Result<String> {
            Ok("sbx-1".to_string())
        }
        async fn exec(&self, _sandbox_id: &str, _cmd: &CommandRequest) -> Result<CommandOutput> {
            Ok(CommandOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
        }
        async fn stop(&self, _sandbox_id: &str) -> Result<()> {
            Ok(())
        }
    }

    /// An `Executor` whose `start` always fails, to exercise the
    /// before-any-step-row startup failure path.
    struct FailingStartExecutor;

    #[async_trait::async_trait]
    impl Executor for FailingStartExecutor {
        async fn start(&self, _run_id: RunId, _kind: RunKind) -> Result<String> {
            Err(OrchestratorError::bad_gateway("executor unreachable"))
        }
        fn is_canceled(&self, _run_id: RunId) -> bool {
            false
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        executor: Arc<FakeExecutor>,
        store: Arc<dyn RunStore>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(RedbRunStore::new(dir.path().join("runs.redb")).unwrap());
        let blob: Arc<dyn crate::storage::blob::BlobStore> =
            Arc::new(FilesystemBlobStore::new(dir.path().join("blobs")).unwrap());
        let events = Arc::new(EventLog::new(dir.path().join("events")).unwrap());
        let steps = Arc::new(StepService::new(store.clone()));
        let allowlist: Arc<dyn SandboxAllowlist> = Arc::new(CommandAllowlist::new(["git"]));
        let sandbox = Arc::new(SandboxSessionManager::new(Arc::new(FakeSandboxBackend), allowlist, store.clone(), blob));
        let approvals = Arc::new(ApprovalService::new(store.clone()));
        let executor = Arc::new(FakeExecutor { canceled: AtomicBool::new(false) });
        let deps = OrchestratorDeps { sandbox, approvals };
        let orchestrator = Orchestrator::new(steps, events, executor.clone(), deps);
        Harness { orchestrator, executor, store, _dir: dir }
    }

    /// Builds a harness around an arbitrary `Executor`, for tests that
    /// need to control whether/how startup fails.
    fn harness_with_executor(executor: Arc<dyn Executor>) -> (Orchestrator, Arc<dyn RunStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(RedbRunStore::new(dir.path().join("runs.redb")).unwrap());
        let blob: Arc<dyn crate::storage::blob::BlobStore> =
            Arc::new(FilesystemBlobStore::new(dir.path().join("blobs")).unwrap());
        let events = Arc::new(EventLog::new(dir.path().join("events")).unwrap());
        let steps = Arc::new(StepService::new(store.clone()));
        let allowlist: Arc<dyn SandboxAllowlist> = Arc::new(CommandAllowlist::new(["git"]));
        let sandbox = Arc::new(SandboxSessionManager::new(Arc::new(FakeSandboxBackend), allowlist, store.clone(), blob));
        let approvals = Arc::new(ApprovalService::new(store.clone()));
        let deps = OrchestratorDeps { sandbox, approvals };
        let orchestrator = Orchestrator::new(steps, events, executor, deps);
        (orchestrator, store, dir)
    }

    #[tokio::test]
    async fn happy_path_research_run_succeeds() {
        let h = harness();
        let run_id = h
            .store
            .create_run("proj", RunKind::Research, json!({}))
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .run(run_id, "proj", RunKind::Research, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Succeeded));
        let run = h.store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.workflow_run_id.as_deref(), Some("wf-1"));
    }

    #[tokio::test]
    async fn cancellation_never_marks_run_failed() {
        let h = harness();
        let run_id = h
            .store
            .create_run("proj", RunKind::Implementation, json!({}))
            .await
            .unwrap();
        h.executor.canceled.store(true, Ordering::SeqCst);

        let outcome = h
            .orchestrator
            .run(run_id, "proj", RunKind::Implementation, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Canceled));
        let run = h.store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn run_finished_emitted_before_done_even_when_canceled_immediately() {
        let h = harness();
        let run_id = h
            .store
            .create_run("proj", RunKind::CodeMode, json!({}))
            .await
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();

        h.orchestrator
            .run(run_id, "proj", RunKind::CodeMode, token)
            .await
            .unwrap();

        // the stream closed; there must be a terminal run-finished entry
        // among the replayed log even though no step ever completed.
        let entries = h.orchestrator.events.read_from(run_id, 0).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| matches!(e.payload, EventPayload::RunFinished { .. })));
    }

    #[tokio::test]
    async fn startup_failure_still_emits_run_finished_and_done() {
        let (orchestrator, store, _dir) = harness_with_executor(Arc::new(FailingStartExecutor));
        let run_id = store
            .create_run("proj", RunKind::Research, json!({}))
            .await
            .unwrap();

        let outcome = orchestrator
            .run(run_id, "proj", RunKind::Research, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        // even though no step ever started, a terminal run-finished entry
        // and the [DONE] marker must still be observable (spec §9 Open
        // Question 3).
        let entries = orchestrator.events.read_from(run_id, 0).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| matches!(e.payload, EventPayload::RunFinished { status: RunStatus::Failed })));
        assert!(orchestrator.events.is_closed(run_id).await);
    }

    /// A sandbox backend whose commands always fail, to exercise the
    /// `verify` step's failure classification (spec §8 scenario 4).
    struct FailingExecBackend;

    #[async_trait::async_trait]
    impl SandboxBackend for FailingExecBackend {
        async fn create(&self, _project_id: &str, _policy: NetworkPolicy) -> Result<String> {
            Ok("sbx-1".to_string())
        }
        async fn exec(&self, _sandbox_id: &str, _cmd: &CommandRequest) -> Result<CommandOutput> {
            Ok(CommandOutput { exit_code: 1, stdout: String::new(), stderr: "boom".into() })
        }
        async fn stop(&self, _sandbox_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn step_failure_halts_the_plan_and_marks_run_failed() {
        // Mirrors spec §8 scenario 4: a step that fails marks only that
        // step failed, the run terminal failed, and no subsequent step in
        // the plan ever starts (`open-pr` never runs after `verify` fails).
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(RedbRunStore::new(dir.path().join("runs.redb")).unwrap());
        let blob: Arc<dyn crate::storage::blob::BlobStore> =
            Arc::new(FilesystemBlobStore::new(dir.path().join("blobs")).unwrap());
        let events = Arc::new(EventLog::new(dir.path().join("events")).unwrap());
        let steps = Arc::new(StepService::new(store.clone()));
        let allowlist: Arc<dyn SandboxAllowlist> = Arc::new(CommandAllowlist::new(["git"]));
        let sandbox = Arc::new(SandboxSessionManager::new(
            Arc::new(FailingExecBackend),
            allowlist,
            store.clone(),
            blob,
        ));
        let approvals = Arc::new(ApprovalService::new(store.clone()));
        let executor = Arc::new(FakeExecutor { canceled: AtomicBool::new(false) });
        let deps = OrchestratorDeps { sandbox, approvals };
        let orchestrator = Orchestrator::new(steps, events, executor, deps);

        let run_id = store
            .create_run("proj", RunKind::Implementation, json!({}))
            .await
            .unwrap();

        let outcome = orchestrator
            .run(run_id, "proj", RunKind::Implementation, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let verify = store
            .get_step(run_id, &StepId::new("verify"))
            .await
            .unwrap();
        assert_eq!(verify.status, StepStatus::Failed);
        assert!(verify.error.is_some());

        // `open-pr` comes after `verify` in the implementation plan and
        // must never have started.
        let open_pr = store.get_step(run_id, &StepId::new("open-pr")).await;
        assert!(open_pr.is_err());
    }
}
