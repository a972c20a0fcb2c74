//! Context shared by every tool call
//!
//! Production builds the service from environment settings; tests inject a
//! service wired to the in-memory engine.

use sandkeep_sandbox::{SandboxService, SandboxSettings};
use std::sync::Arc;

/// Dependencies handed to tool handlers
#[derive(Clone)]
pub struct ToolContext {
    pub(crate) service: Arc<SandboxService>,
}

impl ToolContext {
    pub fn new(service: Arc<SandboxService>) -> Self {
        Self { service }
    }

    /// Load the registry and language table named by `settings`
    pub async fn from_settings(settings: SandboxSettings) -> sandkeep_sandbox::Result<Self> {
        let service = SandboxService::from_settings(settings).await?;
        Ok(Self::new(Arc::new(service)))
    }

    pub fn service(&self) -> &Arc<SandboxService> {
        &self.service
    }
}
