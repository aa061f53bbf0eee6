//! The Run Orchestrator (spec §4.F): the concurrency-critical driver that
//! composes the Step Persistence Service, Event Writer, and Sandbox
//! Session Manager into a correct, cancellation-aware sequence for a
//! given workflow `kind`.
//!
//! Dynamic dispatch over workflow kinds is a registry (`plans::plan_for`)
//! mapping `kind -> &'static [StepPlan]`-shaped builder, not reflection
//! (spec §9 design note). Each step is modeled as `(ctx) -> Result<Value>`
//! driven sequentially by `runner::Orchestrator::run`.

pub mod plans;
pub mod runner;

pub use plans::plan_for;
pub use runner::{
    Executor, Orchestrator, OrchestratorDeps, RunOutcome, StepContext, StepHandler, StepPlan,
};
