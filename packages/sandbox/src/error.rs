// ABOUTME: Error taxonomy for sandbox operations
// ABOUTME: Every public operation fails with a SandboxError carrying a machine-readable kind

use crate::engine::EngineError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Invalid or missing configuration (registry file, language table, settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry entry unknown or not allowed
    #[error("Registry error: {0}")]
    Registry(String),

    /// Capacity or size limit reached
    #[error("Resource limit exceeded: {0}")]
    Resource(String),

    /// Container engine call failed
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Illegal session state transition
    #[error("Invalid state transition: {0}")]
    State(String),

    /// An engine call exceeded its own deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is not running (status: {status})")]
    SessionNotRunning { id: String, status: String },
}

/// Machine-readable error kind, stable across the tool surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Registry,
    Resource,
    Engine,
    State,
    Timeout,
    UnsupportedLanguage,
    SessionNotFound,
    SessionNotRunning,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Registry => "registry",
            ErrorKind::Resource => "resource",
            ErrorKind::Engine => "engine",
            ErrorKind::State => "state",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnsupportedLanguage => "unsupported_language",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionNotRunning => "session_not_running",
        }
    }
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Config(_) => ErrorKind::Config,
            SandboxError::Registry(_) => ErrorKind::Registry,
            SandboxError::Resource(_) => ErrorKind::Resource,
            SandboxError::Engine(EngineError::Timeout(_)) => ErrorKind::Timeout,
            SandboxError::Engine(_) => ErrorKind::Engine,
            SandboxError::State(_) => ErrorKind::State,
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            SandboxError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            SandboxError::SessionNotRunning { .. } => ErrorKind::SessionNotRunning,
        }
    }

    /// Errors caused by caller input are surfaced immediately and never retried
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::Registry | ErrorKind::UnsupportedLanguage
        )
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
