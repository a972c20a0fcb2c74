// ABOUTME: Terminal bridge exposing an interactive web shell inside a running sandbox
// ABOUTME: Launches a detached terminal server and resolves its published host URL

use crate::engine::ContainerStatus;
use crate::error::{Result, SandboxError};
use crate::lifecycle::LifecycleManager;
use crate::tracking::TerminalBinding;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

const TERMINAL_SHELL: &str = "sh";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalInfo {
    pub ok: bool,
    pub host_port: u16,
    pub url: String,
}

/// Outcome of a terminal URL lookup; lookups never fail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TerminalLookup {
    Available { url: String, host_port: u16 },
    NotStarted,
    SessionNotRunning,
    EngineUnreachable { message: String },
}

impl TerminalLookup {
    pub fn url(&self) -> Option<&str> {
        match self {
            TerminalLookup::Available { url, .. } => Some(url),
            _ => None,
        }
    }
}

pub struct TerminalBridge {
    lifecycle: Arc<LifecycleManager>,
}

impl TerminalBridge {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// Launch a terminal server in the session's container.
    ///
    /// Every call launches a new server process; use `get_terminal_url`
    /// first to reuse one that is already up.
    pub async fn start_terminal(
        &self,
        session_id: &str,
        port: Option<u16>,
        command: Option<&str>,
    ) -> Result<TerminalInfo> {
        let session = self.lifecycle.get_session(session_id).await?;
        if !session.status.is_live() {
            return Err(SandboxError::SessionNotRunning {
                id: session_id.to_string(),
                status: session.status.to_string(),
            });
        }
        let container_id = session.instance_id.clone().ok_or_else(|| {
            SandboxError::State(format!("Session {} has no instance attached", session_id))
        })?;

        let settings = self.lifecycle.settings();
        let port = match port {
            Some(port) => port,
            None => self
                .lifecycle
                .registry()
                .resolve(&session.registry_name)
                .await
                .ok()
                .and_then(|entry| entry.terminal_port)
                .unwrap_or(settings.terminal_port),
        };

        let engine = self.lifecycle.engine().get().await?;
        let info = engine.inspect_container(&container_id).await?;
        let host_port = *info.ports.get(&port).ok_or_else(|| {
            SandboxError::Config(format!(
                "Port {} is not published for session {}; the sandbox needs the bridge network policy and a matching terminal_port",
                port, session_id
            ))
        })?;

        let command = command.unwrap_or(&settings.terminal_command);
        let mut argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(SandboxError::Config("Terminal command is empty".to_string()));
        }
        argv.extend([
            "-p".to_string(),
            port.to_string(),
            "-W".to_string(),
            TERMINAL_SHELL.to_string(),
        ]);

        debug!(session_id = %session_id, "Launching terminal server: {:?}", argv);
        engine.exec_detached(&container_id, argv).await?;

        let url = format!("http://{}:{}", settings.terminal_host, host_port);
        self.lifecycle
            .tracker()
            .set_terminal(
                session_id,
                TerminalBinding {
                    container_port: port,
                    host_port,
                    url: url.clone(),
                },
            )
            .await?;

        info!(session_id = %session_id, "Terminal available at {}", url);
        Ok(TerminalInfo {
            ok: true,
            host_port,
            url,
        })
    }

    pub async fn get_terminal_url(&self, session_id: &str, port: Option<u16>) -> TerminalLookup {
        let Some(session) = self.lifecycle.tracker().get(session_id).await else {
            return TerminalLookup::SessionNotRunning;
        };
        if !session.status.is_live() {
            return TerminalLookup::SessionNotRunning;
        }
        let Some(binding) = session.terminal else {
            return TerminalLookup::NotStarted;
        };
        if port.is_some_and(|p| p != binding.container_port) {
            return TerminalLookup::NotStarted;
        }
        let Some(container_id) = session.instance_id else {
            return TerminalLookup::SessionNotRunning;
        };

        let engine = match self.lifecycle.engine().get().await {
            Ok(engine) => engine,
            Err(e) => {
                return TerminalLookup::EngineUnreachable {
                    message: e.to_string(),
                }
            }
        };

        match engine.inspect_container(&container_id).await {
            Ok(info) if info.status != ContainerStatus::Running => {
                TerminalLookup::SessionNotRunning
            }
            Ok(info) => match info.ports.get(&binding.container_port) {
                Some(&host_port) => TerminalLookup::Available {
                    url: format!(
                        "http://{}:{}",
                        self.lifecycle.settings().terminal_host,
                        host_port
                    ),
                    host_port,
                },
                None => TerminalLookup::NotStarted,
            },
            Err(e) => TerminalLookup::EngineUnreachable {
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineClient;
    use crate::languages::LanguageConfig;
    use crate::registry::{NetworkPolicy, Registry};
    use crate::settings::SandboxSettings;
    use crate::testing::{sample_entry, MockEngine};
    use crate::tracking::SessionTracker;

    fn bridge_with(engine: Arc<MockEngine>) -> TerminalBridge {
        let registry = Registry::from_entries(vec![
            sample_entry("isolated", NetworkPolicy::None),
            sample_entry("bridged", NetworkPolicy::Bridge),
        ])
        .unwrap();
        TerminalBridge::new(Arc::new(crate::lifecycle::LifecycleManager::new(
            Arc::new(SandboxSettings::default()),
            Arc::new(registry),
            Arc::new(LanguageConfig::builtin().unwrap()),
            Arc::new(EngineClient::with_engine(engine)),
            Arc::new(SessionTracker::new()),
        )))
    }

    #[tokio::test]
    async fn test_lookup_before_start_is_not_started() {
        let engine = Arc::new(MockEngine::new());
        let bridge = bridge_with(engine);
        let session = bridge.lifecycle.start("bridged", None, None).await.unwrap();

        let lookup = bridge.get_terminal_url(&session.id, None).await;
        assert_eq!(lookup, TerminalLookup::NotStarted);
        assert_eq!(lookup.url(), None);
    }

    #[tokio::test]
    async fn test_start_terminal_publishes_url() {
        let engine = Arc::new(MockEngine::new());
        let bridge = bridge_with(engine.clone());
        let session = bridge.lifecycle.start("bridged", None, None).await.unwrap();

        let info = bridge
            .start_terminal(&session.id, None, None)
            .await
            .unwrap();
        assert!(info.ok);
        assert_eq!(info.url, format!("http://localhost:{}", info.host_port));

        let container = session.instance_id.unwrap();
        let launched = engine.detached_commands(&container);
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0][..3], ["ttyd", "-p", "7681"]);

        let lookup = bridge.get_terminal_url(&session.id, Some(7681)).await;
        assert_eq!(lookup.url(), Some(info.url.as_str()));
    }

    #[tokio::test]
    async fn test_unpublished_port_is_config_error() {
        let engine = Arc::new(MockEngine::new());
        let bridge = bridge_with(engine);
        let session = bridge.lifecycle.start("isolated", None, None).await.unwrap();

        let err = bridge
            .start_terminal(&session.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[tokio::test]
    async fn test_lookup_soft_fails() {
        let engine = Arc::new(MockEngine::new());
        let bridge = bridge_with(engine.clone());

        assert_eq!(
            bridge.get_terminal_url("missing", None).await,
            TerminalLookup::SessionNotRunning
        );

        let session = bridge.lifecycle.start("bridged", None, None).await.unwrap();
        bridge.start_terminal(&session.id, None, None).await.unwrap();

        engine.fail_inspects(true);
        assert!(matches!(
            bridge.get_terminal_url(&session.id, None).await,
            TerminalLookup::EngineUnreachable { .. }
        ));
        engine.fail_inspects(false);

        bridge.lifecycle.stop(&session.id, "test").await.unwrap();
        assert_eq!(
            bridge.get_terminal_url(&session.id, None).await,
            TerminalLookup::SessionNotRunning
        );
    }
}
