//! Server configuration: non-secret settings come from a TOML file plus
//! environment overrides; secrets come from the environment only and
//! are never `Debug`/`Serialize`-derived, logged, or persisted (spec §6).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shiioo_core::approval::ApprovalService;
use shiioo_core::orchestrator::{Orchestrator, OrchestratorDeps};
use shiioo_core::sandbox::{CommandAllowlist, SandboxAllowlist, SandboxBackend, SandboxSessionManager};
use shiioo_core::step_service::StepService;
use shiioo_core::storage::{EventLog, FilesystemBlobStore, RedbRunStore, RunStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
    #[serde(default = "default_run_store_file")]
    pub run_store_file: String,
}

fn default_blob_dir() -> String {
    "blobs".to_string()
}
fn default_event_log_dir() -> String {
    "events".to_string()
}
fn default_run_store_file() -> String {
    "runs.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            event_log_dir: default_event_log_dir(),
            run_store_file: default_run_store_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

fn default_allowed_commands() -> Vec<String> {
    vec!["git".to_string(), "ls".to_string(), "cat".to_string()]
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

/// Secrets injected from the environment only. Deliberately carries no
/// `Debug`/`Serialize` impl so a stray `{:?}` or log line cannot leak
/// one (spec §6).
pub struct Secrets {
    pub sandbox_token: Option<String>,
    pub object_store_token: Option<String>,
    pub llm_api_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            sandbox_token: std::env::var("SHIIOO_SANDBOX_TOKEN").ok(),
            object_store_token: std::env::var("SHIIOO_OBJECT_STORE_TOKEN").ok(),
            llm_api_key: std::env::var("SHIIOO_LLM_API_KEY").ok(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                sandbox: Default::default(),
            }
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn blob_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.blob_dir)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn run_store_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.run_store_file)
    }
}

/// A sandbox backend is still required by `SandboxSessionManager`; the
/// concrete VM vendor stays outside this crate (spec §1) behind this
/// capability trait. This placeholder refuses every command, which is
/// the correct behavior for a server that has not been wired to a real
/// sandbox provider yet.
struct UnconfiguredSandboxBackend;

#[async_trait::async_trait]
impl SandboxBackend for UnconfiguredSandboxBackend {
    async fn create(
        &self,
        _project_id: &str,
        _policy: shiioo_core::sandbox::NetworkPolicy,
    ) -> shiioo_core::error::Result<String> {
        Err(shiioo_core::error::OrchestratorError::env_invalid(
            "no sandbox backend configured",
        ))
    }
    async fn exec(
        &self,
        _sandbox_id: &str,
        _cmd: &shiioo_core::sandbox::CommandRequest,
    ) -> shiioo_core::error::Result<shiioo_core::sandbox::CommandOutput> {
        Err(shiioo_core::error::OrchestratorError::env_invalid(
            "no sandbox backend configured",
        ))
    }
    async fn stop(&self, _sandbox_id: &str) -> shiioo_core::error::Result<()> {
        Ok(())
    }
}

/// An `Executor` that assigns a local opaque workflow run id and never
/// reports external cancellation on its own — cancellation reaches the
/// orchestrator through the `CancellationToken` the run's driver task
/// holds, set by `POST /runs/{id}/cancel` (see `api::handlers::cancel_run`).
struct LocalExecutor;

#[async_trait::async_trait]
impl shiioo_core::orchestrator::Executor for LocalExecutor {
    async fn start(
        &self,
        run_id: shiioo_core::RunId,
        _kind: shiioo_core::RunKind,
    ) -> shiioo_core::error::Result<String> {
        Ok(format!("wf-{run_id}"))
    }
    fn is_canceled(&self, _run_id: shiioo_core::RunId) -> bool {
        false
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub run_store: Arc<dyn RunStore>,
    pub event_log: Arc<EventLog>,
    pub step_service: Arc<StepService>,
    pub orchestrator: Arc<Orchestrator>,
    pub cancellations: Arc<crate::cancel::CancellationRegistry>,
}

impl AppState {
    pub fn new(config: &ServerConfig, _secrets: &Secrets) -> Result<Self> {
        let blob_store = Arc::new(
            FilesystemBlobStore::new(config.blob_path()).context("Failed to create blob store")?,
        );
        let event_log =
            Arc::new(EventLog::new(config.event_log_path()).context("Failed to create event log")?);
        let run_store: Arc<dyn RunStore> = Arc::new(
            RedbRunStore::new(config.run_store_path()).context("Failed to create run store")?,
        );

        let step_service = Arc::new(StepService::new(run_store.clone()));
        let approvals = Arc::new(ApprovalService::new(run_store.clone()));
        let allowlist: Arc<dyn SandboxAllowlist> =
            Arc::new(CommandAllowlist::new(config.sandbox.allowed_commands.clone()));
        let sandbox = Arc::new(SandboxSessionManager::new(
            Arc::new(UnconfiguredSandboxBackend),
            allowlist,
            run_store.clone(),
            blob_store,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            step_service.clone(),
            event_log.clone(),
            Arc::new(LocalExecutor),
            OrchestratorDeps { sandbox, approvals },
        ));

        Ok(Self {
            run_store,
            event_log,
            step_service,
            orchestrator,
            cancellations: Arc::new(crate::cancel::CancellationRegistry::default()),
        })
    }
}
