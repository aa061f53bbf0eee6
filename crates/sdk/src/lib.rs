//! # Shiioo SDK
//!
//! Rust client for the durable run orchestrator's HTTP surface (spec
//! §6): start runs, inspect and cancel them, and tail a run's resumable
//! SSE event stream from any cursor.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use shiioo_sdk::{RunKind, ShiiooClient, ShiiooResult};
//!
//! #[tokio::main]
//! async fn main() -> ShiiooResult<()> {
//!     let client = ShiiooClient::builder()
//!         .base_url("https://shiioo.example.com")
//!         .api_key("sk-your-api-key")
//!         .build()?;
//!
//!     let started = client.runs().start("proj-1", RunKind::Research, None).await?;
//!     println!("started run {}", started.run_id);
//!
//!     let mut stream = client.runs().stream(started.run_id, 0).await?;
//!     while let Some(event) = stream.next_event().await? {
//!         println!("{event:?}");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod stream;
pub mod transport;

pub use client::{ShiiooClient, ShiiooClientBuilder};
pub use config::{ClientConfig, RetryConfig};
pub use error::{ShiiooError, ShiiooResult};
pub use stream::{ResumableStream, StreamEvent};

// Re-export core types for convenience so callers don't need a direct
// `shiioo-core` dependency for the shapes this SDK's responses carry.
pub use shiioo_core::{
    Approval, ApprovalId, ApprovalStatus, BlobHash, Run, RunId, RunKind, RunStatus, SandboxJob,
    SandboxJobId, Step, StepId, StepKind, StepPatch, StepStatus,
};
pub use shiioo_core::events::{EventLogEntry, EventPayload};
