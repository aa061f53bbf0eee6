//! Static, linear step plans per workflow `kind` (spec §4.F, §1 Non-goals:
//! no DAG branching, no dynamic fan-out — each kind is a fixed sequence
//! chosen here, not computed by a scheduler).

use super::runner::{FnStepHandler, OrchestratorDeps, StepContext, StepHandler, StepPlan};
use crate::error::{OrchestratorError, Result};
use crate::sandbox::{CommandRequest, NetworkPolicy};
use crate::types::{ApprovalStatus, RunKind, StepId, StepKind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Looks up the step-plan builder for a run's `kind`. A registry, not a
/// reflective dispatch (spec §9 design note).
pub fn plan_for(kind: RunKind) -> fn(&OrchestratorDeps) -> Vec<StepPlan> {
    match kind {
        RunKind::Research => research_plan,
        RunKind::Implementation => implementation_plan,
        RunKind::CodeMode => code_mode_plan,
    }
}

fn step(id: &str, kind: StepKind, name: &'static str, handler: Arc<dyn StepHandler>) -> StepPlan {
    StepPlan {
        step_id: StepId::new(id),
        step_kind: kind,
        step_name: name,
        handler,
    }
}

fn handler<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(&StepContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnStepHandler(f))
}

/// research: gather -> synthesize -> cite
fn research_plan(_deps: &OrchestratorDeps) -> Vec<StepPlan> {
    vec![
        step(
            "gather",
            StepKind::Tool,
            "Gather sources",
            handler(|ctx| async move {
                ctx.status("Gathering sources…").await?;
                ctx.tool_call("search", json!({ "query": "project context" })).await?;
                let output = json!({ "sources": [] });
                ctx.tool_result("search", output.clone()).await?;
                Ok(json!({ "sources_found": 0 }))
            }),
        ),
        step(
            "synthesize",
            StepKind::Llm,
            "Synthesize findings",
            handler(|ctx| async move {
                ctx.status("Synthesizing findings…").await?;
                for chunk in ["Based on the gathered sources, ", "here is the synthesis."] {
                    ctx.assistant_delta(chunk).await?;
                }
                Ok(json!({ "summary": "synthesis placeholder" }))
            }),
        ),
        step(
            "cite",
            StepKind::Tool,
            "Attach citations",
            handler(|ctx| async move {
                ctx.log("no sources to cite").await?;
                Ok(json!({ "citations": [] }))
            }),
        ),
    ]
}

/// implementation: preflight -> repo-context -> sandbox-checkout -> plan
/// -> patch -> verify -> open-pr
fn implementation_plan(_deps: &OrchestratorDeps) -> Vec<StepPlan> {
    vec![
        step(
            "preflight",
            StepKind::Tool,
            "Preflight checks",
            handler(|ctx| async move {
                ctx.status("Running preflight checks…").await?;
                Ok(json!({ "ok": true }))
            }),
        ),
        step(
            "repo-context",
            StepKind::Tool,
            "Load repo context",
            handler(|ctx| async move {
                ctx.log("loaded repository context").await?;
                Ok(json!({}))
            }),
        ),
        step(
            "sandbox-checkout",
            StepKind::Sandbox,
            "Check out repository in sandbox",
            handler(|ctx| async move {
                let session = ctx
                    .sandbox
                    .start_session(
                        ctx.run_id,
                        &ctx.project_id,
                        "checkout",
                        Some(ctx.step_id.clone()),
                        NetworkPolicy::AllowlistOnly,
                    )
                    .await?;
                let output = session
                    .run_command(CommandRequest {
                        cmd: "git".into(),
                        args: vec!["clone".into(), ".".into()],
                        cwd: None,
                        timeout: Some(Duration::from_secs(120)),
                    })
                    .await?;
                ctx.events
                    .emit(ctx.run_id, crate::events::EventPayload::Exit { exit_code: output.exit_code })
                    .await?;
                session.finalize(output.exit_code, crate::types::StepStatus::Succeeded).await?;
                Ok(json!({ "sandbox_job_id": session.job_id().0 }))
            }),
        ),
        step(
            "plan",
            StepKind::Llm,
            "Plan the change",
            handler(|ctx| async move {
                ctx.assistant_delta("Drafting an implementation plan…").await?;
                Ok(json!({ "plan": "placeholder plan" }))
            }),
        ),
        step(
            "patch",
            StepKind::Sandbox,
            "Apply the patch",
            handler(|ctx| async move {
                let session = ctx
                    .sandbox
                    .start_session(
                        ctx.run_id,
                        &ctx.project_id,
                        "patch",
                        Some(ctx.step_id.clone()),
                        NetworkPolicy::None,
                    )
                    .await?;
                let output = session
                    .run_command(CommandRequest {
                        cmd: "git".into(),
                        args: vec!["apply".into(), "patch.diff".into()],
                        cwd: None,
                        timeout: Some(Duration::from_secs(60)),
                    })
                    .await?;
                session.finalize(output.exit_code, crate::types::StepStatus::Succeeded).await?;
                Ok(json!({}))
            }),
        ),
        step(
            "verify",
            StepKind::Sandbox,
            "Verify the change",
            handler(|ctx| async move {
                let session = ctx
                    .sandbox
                    .start_session(
                        ctx.run_id,
                        &ctx.project_id,
                        "verify",
                        Some(ctx.step_id.clone()),
                        NetworkPolicy::None,
                    )
                    .await?;
                let output = session
                    .run_command(CommandRequest {
                        cmd: "git".into(),
                        args: vec!["status".into()],
                        cwd: None,
                        timeout: Some(Duration::from_secs(300)),
                    })
                    .await?;
                if output.exit_code != 0 {
                    session.finalize(output.exit_code, crate::types::StepStatus::Failed).await?;
                    return Err(OrchestratorError::bad_gateway("verification failed"));
                }
                session.finalize(output.exit_code, crate::types::StepStatus::Succeeded).await?;
                Ok(json!({ "verified": true }))
            }),
        ),
        step(
            "open-pr",
            StepKind::Approval,
            "Open pull request",
            handler(|ctx| async move {
                ctx.approvals
                    .request(ctx.run_id, &ctx.project_id, Some(ctx.step_id.clone()), "repo.merge", "Merge generated patch", json!({}))
                    .await?;
                ctx.status("Waiting for merge approval…").await?;
                let approval = ctx
                    .approvals
                    .await_resolution(ctx.run_id, "repo.merge", &ctx.cancel, Duration::from_millis(500))
                    .await?;
                if approval.status != ApprovalStatus::Approved {
                    return Err(OrchestratorError::bad_request("merge rejected"));
                }
                Ok(json!({ "pr_opened": true }))
            }),
        ),
    ]
}

/// code_mode: session -> summary-artifact
fn code_mode_plan(_deps: &OrchestratorDeps) -> Vec<StepPlan> {
    vec![
        step(
            "session",
            StepKind::Sandbox,
            "Run code-mode session",
            handler(|ctx| async move {
                let session = ctx
                    .sandbox
                    .start_session(
                        ctx.run_id,
                        &ctx.project_id,
                        "code-mode",
                        Some(ctx.step_id.clone()),
                        NetworkPolicy::AllowlistOnly,
                    )
                    .await?;
                let output = session
                    .run_command(CommandRequest {
                        cmd: "git".into(),
                        args: vec!["status".into()],
                        cwd: None,
                        timeout: Some(Duration::from_secs(600)),
                    })
                    .await?;
                session.finalize(output.exit_code, crate::types::StepStatus::Succeeded).await?;
                Ok(json!({ "sandbox_job_id": session.job_id().0 }))
            }),
        ),
        step(
            "summary-artifact",
            StepKind::Tool,
            "Write summary artifact",
            handler(|ctx| async move {
                ctx.log("session summary recorded").await?;
                Ok(json!({ "artifact": "summary.md" }))
            }),
        ),
    ]
}
