//! Core of the Durable Run Orchestrator: the persisted Run & Step State
//! Machine and the Resumable Event Stream Layer, plus the concurrency-
//! critical driver (`orchestrator`) that composes them.

pub mod approval;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod sandbox;
pub mod step_service;
pub mod storage;
pub mod types;

pub use error::{ErrorCode, OrchestratorError, Result};
pub use types::*;
