// ABOUTME: Service facade wiring registry, languages, engine, tracking, lifecycle, executor and terminal
// ABOUTME: Owns the background sweeper and the startup/shutdown sequence

use crate::engine::{Engine, EngineClient};
use crate::error::Result;
use crate::executor::CodeExecutor;
use crate::languages::LanguageConfig;
use crate::lifecycle::{LifecycleManager, OrphanReport, SweeperHandle};
use crate::registry::Registry;
use crate::settings::SandboxSettings;
use crate::terminal::TerminalBridge;
use crate::tracking::SessionTracker;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct SandboxService {
    settings: Arc<SandboxSettings>,
    registry: Arc<Registry>,
    languages: Arc<LanguageConfig>,
    lifecycle: Arc<LifecycleManager>,
    executor: CodeExecutor,
    terminal: TerminalBridge,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl SandboxService {
    /// Load the registry and language table and prepare a lazily-connected Docker engine
    pub async fn from_settings(settings: SandboxSettings) -> Result<Self> {
        settings.validate()?;
        let registry = Registry::load(&settings.registry_path).await?;
        let languages = match &settings.languages_path {
            Some(path) => LanguageConfig::load(path).await?,
            None => LanguageConfig::builtin()?,
        };
        let engine = EngineClient::docker(&settings);
        Ok(Self::assemble(settings, registry, languages, engine))
    }

    /// Build the service around an injected engine
    pub fn with_engine(
        settings: SandboxSettings,
        registry: Registry,
        languages: LanguageConfig,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self::assemble(settings, registry, languages, EngineClient::with_engine(engine))
    }

    fn assemble(
        settings: SandboxSettings,
        registry: Registry,
        languages: LanguageConfig,
        engine: EngineClient,
    ) -> Self {
        let settings = Arc::new(settings);
        let registry = Arc::new(registry);
        let languages = Arc::new(languages);
        let lifecycle = Arc::new(LifecycleManager::new(
            settings.clone(),
            registry.clone(),
            languages.clone(),
            Arc::new(engine),
            Arc::new(SessionTracker::new()),
        ));

        Self {
            executor: CodeExecutor::new(lifecycle.clone(), languages.clone()),
            terminal: TerminalBridge::new(lifecycle.clone()),
            settings,
            registry,
            languages,
            lifecycle,
            sweeper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn languages(&self) -> &LanguageConfig {
        &self.languages
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn executor(&self) -> &CodeExecutor {
        &self.executor
    }

    pub fn terminal(&self) -> &TerminalBridge {
        &self.terminal
    }

    /// Reap leftovers from a previous run and start the sweeper.
    /// An unreachable engine is not fatal here; starts will report it.
    pub async fn startup(&self) -> Option<OrphanReport> {
        self.startup_with(true).await
    }

    /// Like `startup`, optionally leaving labelled containers alone
    pub async fn startup_with(&self, reap_orphans: bool) -> Option<OrphanReport> {
        let report = if !reap_orphans {
            None
        } else if self.lifecycle.engine().is_available().await {
            match self.lifecycle.reap_orphans(false).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Orphan cleanup failed: {}", e);
                    None
                }
            }
        } else {
            warn!("Container engine unavailable at startup; skipping orphan cleanup");
            None
        };

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            *sweeper = Some(self.lifecycle.spawn_sweeper(self.settings.sweep_interval()));
        }
        report
    }

    /// Stop the sweeper, then every live session
    pub async fn shutdown(&self) -> usize {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.shutdown().await;
        }
        let stopped = self.lifecycle.shutdown_all().await;
        info!("Sandbox service shut down");
        stopped
    }
}
