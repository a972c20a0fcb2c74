// ABOUTME: Registry-gated sandbox manager for running untrusted code in isolated containers
// ABOUTME: Exposes the service facade plus registry, languages, engine, tracking, lifecycle, executor and terminal

pub mod engine;
pub mod error;
pub mod executor;
pub mod images;
pub mod languages;
pub mod lifecycle;
pub mod registry;
pub mod service;
pub mod settings;
pub mod terminal;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod tracking;

pub use engine::{DockerEngine, Engine, EngineClient, EngineError};
pub use error::{ErrorKind, Result, SandboxError};
pub use executor::{CodeExecutor, ExecutionRequest, ExecutionResult, ExecutionTarget};
pub use languages::{LanguageConfig, LanguageSpec};
pub use lifecycle::{LifecycleManager, OrphanReport, StopOutcome, SweepReport, SweeperHandle};
pub use registry::{NetworkPolicy, Registry, RegistryEntry};
pub use service::SandboxService;
pub use settings::SandboxSettings;
pub use terminal::{TerminalBridge, TerminalInfo, TerminalLookup};
pub use tracking::{Session, SessionStatus, SessionTracker, TerminalBinding};
