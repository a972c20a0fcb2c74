// ABOUTME: Container engine abstraction consumed by lifecycle, executor and terminal bridge
// ABOUTME: Engine trait, its data types, and the lazily-connected EngineClient factory

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

pub mod docker;

pub use docker::DockerEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine call timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Everything needed to create one sandbox container
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    pub cpu_limit: f64,
    pub mem_limit_bytes: u64,
    pub pids_limit: i64,
    pub network_mode: String,
    /// Container ports published to ephemeral host ports
    pub published_ports: Vec<u16>,
    /// Host interface published ports bind to
    pub publish_host_ip: String,
    /// Keep-alive command; code runs through exec, never as the main process
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub ports: HashMap<u16, u16>, // container_port -> host_port
    pub labels: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Removing,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn from_state(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" | "restarting" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Stopped,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamType,
    pub data: Vec<u8>,
}

/// Incremental exec output; the sender side closes when the process exits
pub struct OutputStream {
    pub receiver: tokio::sync::mpsc::UnboundedReceiver<OutputChunk>,
}

/// A started, attached exec
pub struct ExecHandle {
    pub exec_id: String,
    /// Identifies the in-sandbox process for `kill_exec`
    pub process_tag: String,
    pub output: OutputStream,
}

/// Container engine operations
#[async_trait]
pub trait Engine: Send + Sync {
    /// Check that the engine daemon answers
    async fn ping(&self) -> EngineResult<()>;

    async fn image_exists(&self, image: &str) -> EngineResult<bool>;

    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    /// Build an image from an inline Dockerfile and tag it
    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        labels: HashMap<String, String>,
    ) -> EngineResult<()>;

    /// Create a container (not started), returning its id
    async fn create_container(&self, config: &ContainerConfig) -> EngineResult<String>;

    async fn start_container(&self, container_id: &str) -> EngineResult<()>;

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> EngineResult<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> EngineResult<()>;

    async fn inspect_container(&self, container_id: &str) -> EngineResult<ContainerInfo>;

    /// Every container carrying this manager's label, running or not
    async fn list_managed_containers(&self) -> EngineResult<Vec<ContainerInfo>>;

    /// Replace a single file inside the container in one upload
    async fn write_file(&self, container_id: &str, path: &str, contents: &[u8])
        -> EngineResult<()>;

    /// Start a command with stdout/stderr attached
    async fn exec_attached(&self, container_id: &str, command: Vec<String>)
        -> EngineResult<ExecHandle>;

    /// Start a background command and return its exec id
    async fn exec_detached(&self, container_id: &str, command: Vec<String>)
        -> EngineResult<String>;

    /// Kill the in-sandbox process started by `exec_attached`, leaving the container running
    async fn kill_exec(&self, container_id: &str, process_tag: &str) -> EngineResult<()>;

    /// Exit code of a finished exec; `None` while it is still running
    async fn exec_exit_code(&self, exec_id: &str) -> EngineResult<Option<i64>>;
}

/// Upper bound on one availability ping
const PING_TIMEOUT: Duration = Duration::from_secs(5);

type EngineFactory = Box<dyn Fn() -> EngineResult<Arc<dyn Engine>> + Send + Sync>;

/// Lazily-connected engine handle shared by every component.
///
/// The underlying engine is created on first use, exactly once, even when
/// many callers race on it. Availability probes are cached for a short TTL.
pub struct EngineClient {
    factory: EngineFactory,
    engine: OnceCell<Arc<dyn Engine>>,
    availability: Mutex<Option<(Instant, bool)>>,
    availability_ttl: Duration,
}

impl EngineClient {
    pub fn new<F>(factory: F, availability_ttl: Duration) -> Self
    where
        F: Fn() -> EngineResult<Arc<dyn Engine>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            engine: OnceCell::new(),
            availability: Mutex::new(None),
            availability_ttl,
        }
    }

    /// Docker-backed client; the daemon is contacted on first use
    pub fn docker(settings: &crate::settings::SandboxSettings) -> Self {
        let label_prefix = settings.label_prefix.clone();
        Self::new(
            move || {
                let engine = DockerEngine::connect(&label_prefix)?;
                Ok(Arc::new(engine) as Arc<dyn Engine>)
            },
            Duration::from_secs(settings.engine_availability_ttl_secs),
        )
    }

    /// Wrap an already-constructed engine
    pub fn with_engine(engine: Arc<dyn Engine>) -> Self {
        Self::new(move || Ok(engine.clone()), Duration::from_secs(1))
    }

    pub async fn get(&self) -> EngineResult<Arc<dyn Engine>> {
        self.engine
            .get_or_try_init(|| async {
                debug!("Initializing container engine client");
                (self.factory)()
            })
            .await
            .cloned()
    }

    /// Cached liveness check. The cache lock is never held across the ping,
    /// so one slow daemon round-trip does not stall other callers.
    pub async fn is_available(&self) -> bool {
        if let Some((checked_at, available)) = *self.availability.lock().await {
            if checked_at.elapsed() < self.availability_ttl {
                return available;
            }
        }

        let available = match self.get().await {
            Ok(engine) => match tokio::time::timeout(PING_TIMEOUT, engine.ping()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Container engine not available: {}", e);
                    false
                }
                Err(_) => {
                    let e = EngineError::Timeout(format!("ping after {:?}", PING_TIMEOUT));
                    warn!("Container engine not available: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("Failed to initialize container engine: {}", e);
                false
            }
        };

        *self.availability.lock().await = Some((Instant::now(), available));
        available
    }

    /// Drop the cached availability result so the next probe hits the engine
    pub async fn invalidate_availability(&self) {
        *self.availability.lock().await = None;
    }
}
