// ABOUTME: Session lifecycle: admission, container provisioning, teardown and TTL sweeping
// ABOUTME: Engine calls happen outside the tracking lock; stop is idempotent and best effort

use crate::engine::{ContainerConfig, EngineClient, EngineError};
use crate::error::{ErrorKind, Result, SandboxError};
use crate::images::ImageCache;
use crate::languages::LanguageConfig;
use crate::registry::{Registry, RegistryEntry};
use crate::settings::SandboxSettings;
use crate::tracking::{NewSession, Session, SessionStatus, SessionTracker, TerminationOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const START_ATTEMPTS: usize = 2;
const KEEP_ALIVE: [&str; 3] = ["tail", "-f", "/dev/null"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// What one sweep pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub stopped: usize,
    pub failures: Vec<String>,
    pub purged: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub found: Vec<String>,
    pub removed: usize,
    pub errors: Vec<String>,
}

pub struct LifecycleManager {
    settings: Arc<SandboxSettings>,
    registry: Arc<Registry>,
    languages: Arc<LanguageConfig>,
    engine: Arc<EngineClient>,
    tracker: Arc<SessionTracker>,
    images: ImageCache,
}

impl LifecycleManager {
    pub fn new(
        settings: Arc<SandboxSettings>,
        registry: Arc<Registry>,
        languages: Arc<LanguageConfig>,
        engine: Arc<EngineClient>,
        tracker: Arc<SessionTracker>,
    ) -> Self {
        let images = ImageCache::new(
            engine.clone(),
            Duration::from_secs(settings.image_timeout_secs),
            &settings.label_prefix,
        );
        Self {
            settings,
            registry,
            languages,
            engine,
            tracker,
            images,
        }
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn engine(&self) -> &Arc<EngineClient> {
        &self.engine
    }

    pub fn settings(&self) -> &Arc<SandboxSettings> {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start a session on an allowed registry entry
    pub async fn start(
        &self,
        registry_name: &str,
        language: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Session> {
        // Held for the whole start so a concurrent reload cannot pull it away
        let entry = self.registry.resolve(registry_name).await?;

        let language = match language {
            Some(requested) => {
                let spec = self.languages.resolve(requested)?;
                if !entry.allows_language(&spec.name) {
                    return Err(SandboxError::UnsupportedLanguage(format!(
                        "{} is not allowed in sandbox '{}'",
                        spec.name, entry.name
                    )));
                }
                Some(spec.name.clone())
            }
            None => None,
        };

        let ttl_secs = ttl
            .map(|t| t.as_secs())
            .unwrap_or(entry.default_ttl_secs)
            .clamp(1, self.settings.max_session_ttl_secs);

        let session = self
            .tracker
            .register(
                NewSession {
                    registry_name: entry.name.clone(),
                    language,
                    ttl_secs,
                },
                self.settings.max_concurrent_sessions,
            )
            .await?;

        info!(
            session_id = %session.id,
            "Starting sandbox '{}' (ttl: {}s)", entry.name, ttl_secs
        );

        match self.provision(&session.id, &entry).await {
            Ok(container_id) => {
                let snapshot = self
                    .tracker
                    .transition(&session.id, SessionStatus::Running)
                    .await?;
                info!(
                    session_id = %session.id,
                    container_id = %container_id,
                    "Sandbox running"
                );
                Ok(snapshot)
            }
            Err(e) => {
                error!(session_id = %session.id, "Failed to start sandbox: {}", e);
                if let Err(mark_err) = self.tracker.fail(&session.id, e.to_string()).await {
                    warn!(session_id = %session.id, "Failed to mark session as errored: {}", mark_err);
                }
                if let Err(term_err) = self.tracker.terminate(&session.id).await {
                    warn!(session_id = %session.id, "Failed to release failed session: {}", term_err);
                }
                Err(e)
            }
        }
    }

    /// Prepare the image and bring up a container, attaching it to the session.
    /// Engine-side failures get one more attempt; caller errors and timeouts do not.
    async fn provision(&self, session_id: &str, entry: &RegistryEntry) -> Result<String> {
        let mut attempt = 0;
        let container_id = loop {
            attempt += 1;
            match self.try_provision(session_id, entry).await {
                Ok(id) => break id,
                Err(e)
                    if attempt < START_ATTEMPTS
                        && !e.is_caller_error()
                        && e.kind() != ErrorKind::Timeout =>
                {
                    warn!(
                        session_id = %session_id,
                        "Provisioning attempt {} failed, retrying: {}", attempt, e
                    );
                    self.engine.invalidate_availability().await;
                }
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = self.tracker.attach_instance(session_id, &container_id).await {
            self.teardown(&container_id).await;
            return Err(e);
        }
        Ok(container_id)
    }

    async fn try_provision(&self, session_id: &str, entry: &RegistryEntry) -> Result<String> {
        if !self.engine.is_available().await {
            return Err(EngineError::Connection(
                "container engine is not available".to_string(),
            )
            .into());
        }

        let image = self.images.ensure(entry).await?;
        let config = self.container_config(session_id, entry, image);
        Ok(self.create_and_start(&config).await?)
    }

    async fn create_and_start(&self, config: &ContainerConfig) -> std::result::Result<String, EngineError> {
        let engine = self.engine.get().await?;
        let container_id = engine.create_container(config).await?;

        if let Err(e) = engine.start_container(&container_id).await {
            // Never leave a half-started container behind
            if let Err(remove_err) = engine.remove_container(&container_id, true).await {
                warn!(
                    container_id = %container_id,
                    "Failed to remove partially created container: {}", remove_err
                );
            }
            return Err(e);
        }
        Ok(container_id)
    }

    fn container_config(&self, session_id: &str, entry: &RegistryEntry, image: String) -> ContainerConfig {
        let prefix = &self.settings.label_prefix;
        let labels = HashMap::from([
            (format!("{}.session_id", prefix), session_id.to_string()),
            (format!("{}.registry", prefix), entry.name.clone()),
        ]);

        let published_ports = if entry.network_policy.allows_published_ports() {
            vec![entry.terminal_port.unwrap_or(self.settings.terminal_port)]
        } else {
            Vec::new()
        };

        let publish_host_ip = match self.settings.terminal_host.as_str() {
            "localhost" | "127.0.0.1" => "127.0.0.1",
            _ => "0.0.0.0",
        };

        ContainerConfig {
            name: format!("sandkeep-{}", session_id),
            image,
            env: entry.env.clone(),
            labels,
            cpu_limit: entry.cpu_limit,
            mem_limit_bytes: entry.mem_limit_bytes,
            pids_limit: entry.pids_limit,
            network_mode: entry.network_policy.network_mode().to_string(),
            published_ports,
            publish_host_ip: publish_host_ip.to_string(),
            command: KEEP_ALIVE.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Stop a session and remove its container. Safe to call repeatedly.
    pub async fn stop(&self, session_id: &str, reason: &str) -> Result<StopOutcome> {
        match self.tracker.terminate(session_id).await? {
            TerminationOutcome::AlreadyTerminated => {
                debug!(session_id = %session_id, "Stop requested for already terminated session");
                Ok(StopOutcome::AlreadyStopped)
            }
            TerminationOutcome::Terminated {
                instance_id,
                terminal,
            } => {
                if let Some(terminal) = terminal {
                    debug!(
                        session_id = %session_id,
                        "Releasing terminal binding on host port {}", terminal.host_port
                    );
                }
                if let Some(container_id) = instance_id {
                    self.teardown(&container_id).await;
                }
                info!(session_id = %session_id, "Sandbox stopped ({})", reason);
                Ok(StopOutcome::Stopped)
            }
        }
    }

    /// Best-effort container stop and removal; failures are logged only
    async fn teardown(&self, container_id: &str) {
        let engine = match self.engine.get().await {
            Ok(engine) => engine,
            Err(e) => {
                warn!(container_id = %container_id, "Cannot reach engine for teardown: {}", e);
                return;
            }
        };

        match engine
            .stop_container(container_id, self.settings.stop_timeout_secs)
            .await
        {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => warn!(container_id = %container_id, "Failed to stop container: {}", e),
        }
        match engine.remove_container(container_id, true).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => warn!(container_id = %container_id, "Failed to remove container: {}", e),
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Expire lapsed sessions as of `now`, tear them down and purge old records
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            expired: self.tracker.expire_idle(now).await,
            ..Default::default()
        };

        for session_id in &report.expired {
            match self.stop(session_id, "ttl expired").await {
                Ok(StopOutcome::Stopped) => report.stopped += 1,
                Ok(StopOutcome::AlreadyStopped) => {}
                Err(e) => {
                    warn!(session_id = %session_id, "Failed to stop expired session: {}", e);
                    report.failures.push(format!("{}: {}", session_id, e));
                }
            }
        }

        let retention = chrono::Duration::seconds(self.settings.terminated_retention_secs as i64);
        report.purged = self.tracker.purge_terminated(now - retention).await;

        if !report.expired.is_empty() || report.purged > 0 {
            info!(
                "Sweep: {} expired, {} stopped, {} failed, {} purged",
                report.expired.len(),
                report.stopped,
                report.failures.len(),
                report.purged
            );
        }
        report
    }

    /// Run `sweep` every `interval` until the returned handle is shut down
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let token = CancellationToken::new();
        let manager = self.clone();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            info!("Sweeper started (interval: {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                }
            }
            info!("Sweeper stopped");
        });

        SweeperHandle { token, task }
    }

    /// Stop every session that is not already terminated
    pub async fn shutdown_all(&self) -> usize {
        let ids = self.tracker.live_ids().await;
        let mut stopped = 0;
        for id in ids {
            match self.stop(&id, "shutdown").await {
                Ok(StopOutcome::Stopped) => stopped += 1,
                Ok(StopOutcome::AlreadyStopped) => {}
                Err(e) => warn!(session_id = %id, "Failed to stop session on shutdown: {}", e),
            }
        }
        info!("Shutdown stopped {} sessions", stopped);
        stopped
    }

    /// Remove managed containers that no tracked session owns
    pub async fn reap_orphans(&self, dry_run: bool) -> Result<OrphanReport> {
        let engine = self.engine.get().await?;
        let containers = engine.list_managed_containers().await?;
        let owned = self.tracker.owned_instances().await;

        let mut report = OrphanReport::default();
        for container in containers.into_iter().filter(|c| !owned.contains(&c.id)) {
            warn!(
                "Found orphaned container: {} (name: {})",
                container.id, container.name
            );
            report.found.push(container.id.clone());

            if dry_run {
                continue;
            }
            match engine.remove_container(&container.id, true).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {
                    info!("Removed orphaned container: {}", container.id);
                    report.removed += 1;
                }
                Err(e) => {
                    let msg = format!(
                        "Failed to remove orphaned container {}: {}",
                        container.id, e
                    );
                    warn!("{}", msg);
                    report.errors.push(msg);
                }
            }
        }

        if !report.found.is_empty() {
            info!(
                "Orphan cleanup: found {}, removed {} (failed: {}, dry run: {})",
                report.found.len(),
                report.removed,
                report.errors.len(),
                dry_run
            );
        }
        Ok(report)
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.tracker.list().await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.tracker
            .get(session_id)
            .await
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))
    }
}

/// Handle to the background sweeper task
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal the sweeper and wait for it to exit
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Sweeper task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NetworkPolicy;
    use crate::testing::{sample_entry, MockEngine};
    use chrono::Duration as ChronoDuration;

    fn manager_with(engine: Arc<MockEngine>, cap: usize) -> Arc<LifecycleManager> {
        let settings = SandboxSettings {
            max_concurrent_sessions: cap,
            ..SandboxSettings::default()
        };
        let registry = Registry::from_entries(vec![
            sample_entry("python-small", NetworkPolicy::None),
            sample_entry("polyglot", NetworkPolicy::Bridge),
        ])
        .unwrap();
        Arc::new(LifecycleManager::new(
            Arc::new(settings),
            Arc::new(registry),
            Arc::new(LanguageConfig::builtin().unwrap()),
            Arc::new(EngineClient::with_engine(engine)),
            Arc::new(SessionTracker::new()),
        ))
    }

    #[tokio::test]
    async fn test_start_creates_running_session() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);

        let session = manager
            .start("python-small", Some("py"), None)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.language.as_deref(), Some("python"));
        assert_eq!(engine.running_count(), 1);

        let container = session.instance_id.unwrap();
        let labels = engine.container_labels(&container).unwrap();
        assert_eq!(labels["sandkeep.sandbox.session_id"], session.id);
    }

    #[tokio::test]
    async fn test_unknown_registry_name_creates_nothing() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);

        let err = manager.start("rm -rf", None, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Registry(_)));
        assert_eq!(engine.create_count(), 0);
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_language_rejected_before_admission() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);

        // sample entries only allow python and sh
        let err = manager
            .start("python-small", Some("ruby"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
        assert_eq!(engine.create_count(), 0);
    }

    #[tokio::test]
    async fn test_ttl_is_clamped() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine, 4);

        let session = manager
            .start("python-small", None, Some(Duration::from_secs(999_999)))
            .await
            .unwrap();
        assert_eq!(session.ttl_secs, 3600);
    }

    #[tokio::test]
    async fn test_single_create_failure_is_retried() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_creates(1);
        let manager = manager_with(engine.clone(), 4);

        let session = manager.start("python-small", None, None).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(engine.create_count(), 2);
    }

    #[tokio::test]
    async fn test_pull_failure_is_retried() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_pulls(1);
        let manager = manager_with(engine.clone(), 4);

        let session = manager.start("python-small", None, None).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(engine.pull_count(), 2);
        assert_eq!(engine.create_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_pull_failure_gives_up() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_pulls(5);
        let manager = manager_with(engine.clone(), 4);

        let err = manager.start("python-small", None, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Engine(EngineError::Image(_))));
        assert_eq!(engine.pull_count(), START_ATTEMPTS);
        assert_eq!(engine.create_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_failure_releases_slot() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_creates(2);
        let manager = manager_with(engine.clone(), 1);

        let err = manager.start("python-small", None, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Engine(_)));
        assert_eq!(engine.running_count(), 0);

        let sessions = manager.list_sessions().await;
        assert_eq!(sessions[0].status, SessionStatus::Terminated);
        assert!(sessions[0].error.is_some());

        // The failed attempt does not hold the only slot
        assert!(manager.start("python-small", None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_fails_fast_when_engine_down() {
        let engine = Arc::new(MockEngine::new());
        engine.set_available(false);
        let manager = manager_with(engine.clone(), 4);

        let err = manager.start("python-small", None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Engine);
        assert_eq!(engine.create_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);
        let session = manager.start("python-small", None, None).await.unwrap();

        assert_eq!(
            manager.stop(&session.id, "test").await.unwrap(),
            StopOutcome::Stopped
        );
        assert_eq!(
            manager.stop(&session.id, "test").await.unwrap(),
            StopOutcome::AlreadyStopped
        );
        assert_eq!(engine.running_count(), 0);
        assert_eq!(engine.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_survives_engine_errors() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);
        let session = manager.start("python-small", None, None).await.unwrap();

        engine.fail_removes(true);
        assert_eq!(
            manager.stop(&session.id, "test").await.unwrap(),
            StopOutcome::Stopped
        );
        assert_eq!(
            manager.get_session(&session.id).await.unwrap().status,
            SessionStatus::Terminated
        );
    }

    #[tokio::test]
    async fn test_sweep_tears_down_expired_sessions() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);
        let short = manager
            .start("python-small", None, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let long = manager
            .start("python-small", None, Some(Duration::from_secs(600)))
            .await
            .unwrap();

        let report = manager
            .sweep_at(Utc::now() + ChronoDuration::seconds(6))
            .await;
        assert_eq!(report.expired, vec![short.id.clone()]);
        assert_eq!(report.stopped, 1);
        assert_eq!(
            manager.get_session(&short.id).await.unwrap().status,
            SessionStatus::Terminated
        );
        assert_eq!(
            manager.get_session(&long.id).await.unwrap().status,
            SessionStatus::Running
        );
        assert_eq!(engine.running_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_purges_old_terminated_records() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine, 4);
        let session = manager.start("python-small", None, None).await.unwrap();
        manager.stop(&session.id, "test").await.unwrap();

        let report = manager
            .sweep_at(Utc::now() + ChronoDuration::seconds(601))
            .await;
        assert_eq!(report.purged, 1);
        assert!(manager.get_session(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_reap_orphans_spares_tracked_containers() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);
        let session = manager.start("python-small", None, None).await.unwrap();
        engine.add_orphan("leftover-1");
        engine.add_orphan("leftover-2");

        let dry = manager.reap_orphans(true).await.unwrap();
        assert_eq!(dry.found.len(), 2);
        assert_eq!(dry.removed, 0);

        let report = manager.reap_orphans(false).await.unwrap();
        assert_eq!(report.removed, 2);
        assert!(engine.has_container(session.instance_id.as_deref().unwrap()));
        assert!(!engine.has_container("leftover-1"));
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_everything() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine.clone(), 4);
        for _ in 0..3 {
            manager.start("python-small", None, None).await.unwrap();
        }

        assert_eq!(manager.shutdown_all().await, 3);
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_shutdown_waits_for_task() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager_with(engine, 4);

        let handle = manager.spawn_sweeper(Duration::from_millis(10));
        let token = handle.cancellation_token();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
        assert!(token.is_cancelled());
    }
}
