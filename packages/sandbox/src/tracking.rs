// ABOUTME: Session tracking: the single owner of session state and its transition rules
// ABOUTME: Admission control, sliding TTL, execution bookkeeping and idempotent termination claims

use crate::error::{Result, SandboxError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Idle,
    Expired,
    Error,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Expired => "expired",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }

    /// Counts against the concurrency cap
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Idle)
    }

    /// Accepts executions and terminal requests
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Idle)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Error) => *self != Error,
            (Starting, Running) => true,
            (Running, Idle) | (Idle, Running) => true,
            (Idle, Expired) => true,
            (Running | Idle | Expired | Error, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalBinding {
    pub container_port: u16,
    pub host_port: u16,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub registry_name: String,
    pub language: Option<String>,
    pub instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub status: SessionStatus,
    pub busy: bool,
    pub error: Option<String>,
    pub terminal: Option<TerminalBinding>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_activity_at + ttl_duration(self.ttl_secs)
    }
}

/// Parameters for a session about to be created
#[derive(Debug, Clone)]
pub struct NewSession {
    pub registry_name: String,
    pub language: Option<String>,
    pub ttl_secs: u64,
}

/// Result of claiming a session for teardown
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationOutcome {
    AlreadyTerminated,
    Terminated {
        instance_id: Option<String>,
        terminal: Option<TerminalBinding>,
    },
}

fn ttl_duration(ttl_secs: u64) -> Duration {
    // Capped at a century so timestamp arithmetic cannot overflow
    Duration::seconds(ttl_secs.min(100 * 365 * 24 * 3600) as i64)
}

/// Owner of every session record
#[derive(Default)]
pub struct SessionTracker {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `starting` session unless `cap` active sessions already exist
    pub async fn register(&self, new: NewSession, cap: usize) -> Result<Session> {
        let mut sessions = self.sessions.write().await;

        let active = sessions.values().filter(|s| s.status.is_active()).count();
        if active >= cap {
            return Err(SandboxError::Resource(format!(
                "Maximum concurrent sessions ({}) reached",
                cap
            )));
        }

        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            registry_name: new.registry_name,
            language: new.language,
            instance_id: None,
            created_at: now,
            last_activity_at: now,
            ttl_secs: new.ttl_secs,
            status: SessionStatus::Starting,
            busy: false,
            error: None,
            terminal: None,
            terminated_at: None,
        };

        debug!(session_id = %session.id, "Registered session for {}", session.registry_name);
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn attach_instance(&self, id: &str, instance_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;

        if let Some(other) = sessions
            .values()
            .find(|s| s.id != id && s.instance_id.as_deref() == Some(instance_id))
        {
            return Err(SandboxError::State(format!(
                "Instance {} already belongs to session {}",
                instance_id, other.id
            )));
        }

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        if session.instance_id.is_some() {
            return Err(SandboxError::State(format!(
                "Session {} already has an instance",
                id
            )));
        }
        session.instance_id = Some(instance_id.to_string());
        Ok(())
    }

    /// Slide the TTL window forward
    pub async fn touch(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        session.last_activity_at = Utc::now();
        Ok(())
    }

    /// Apply an explicit status change. `Expired` is reserved for `expire_idle`.
    pub async fn transition(&self, id: &str, next: SessionStatus) -> Result<Session> {
        if next == SessionStatus::Expired {
            return Err(SandboxError::State(format!(
                "Session {} can only expire through the TTL sweep",
                id
            )));
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        apply_transition(session, next)?;
        Ok(session.clone())
    }

    /// Mark a session busy for one execution and return its instance id
    pub async fn begin_execution(&self, id: &str) -> Result<String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;

        if !session.status.is_live() {
            return Err(SandboxError::SessionNotRunning {
                id: id.to_string(),
                status: session.status.to_string(),
            });
        }
        let instance_id = session.instance_id.clone().ok_or_else(|| {
            SandboxError::State(format!("Session {} has no instance attached", id))
        })?;

        if session.status == SessionStatus::Idle {
            apply_transition(session, SessionStatus::Running)?;
        }
        session.busy = true;
        session.last_activity_at = Utc::now();
        Ok(instance_id)
    }

    /// Clear the busy flag; a session torn down mid-execution is left as is
    pub async fn end_execution(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return Ok(());
        };

        session.busy = false;
        if session.status == SessionStatus::Running {
            session.last_activity_at = Utc::now();
            apply_transition(session, SessionStatus::Idle)?;
        }
        Ok(())
    }

    /// Mark every live, non-busy session whose TTL has lapsed as expired.
    /// No teardown happens here.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();

        for session in sessions.values_mut() {
            if !session.status.is_live() || session.busy {
                continue;
            }
            if now - session.last_activity_at <= ttl_duration(session.ttl_secs) {
                continue;
            }
            if session.status == SessionStatus::Running {
                session.status = SessionStatus::Idle;
            }
            session.status = SessionStatus::Expired;
            info!(session_id = %session.id, "Session expired after {}s idle", session.ttl_secs);
            expired.push(session.id.clone());
        }

        expired
    }

    /// Claim a session for teardown; only the first caller gets `Terminated`
    pub async fn terminate(&self, id: &str) -> Result<TerminationOutcome> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;

        if session.status == SessionStatus::Terminated {
            return Ok(TerminationOutcome::AlreadyTerminated);
        }
        apply_transition(session, SessionStatus::Terminated)?;
        session.busy = false;
        session.terminated_at = Some(Utc::now());

        Ok(TerminationOutcome::Terminated {
            instance_id: session.instance_id.clone(),
            terminal: session.terminal.take(),
        })
    }

    pub async fn fail(&self, id: &str, message: impl Into<String>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        apply_transition(session, SessionStatus::Error)?;
        session.error = Some(message.into());
        Ok(())
    }

    pub async fn set_terminal(&self, id: &str, binding: TerminalBinding) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        if !session.status.is_live() {
            return Err(SandboxError::SessionNotRunning {
                id: id.to_string(),
                status: session.status.to_string(),
            });
        }
        session.terminal = Some(binding);
        session.last_activity_at = Utc::now();
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Snapshot of every session, oldest first
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status.is_active())
            .count()
    }

    /// Instance ids still owned by a session that is not terminated
    pub async fn owned_instances(&self) -> HashSet<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status != SessionStatus::Terminated)
            .filter_map(|s| s.instance_id.clone())
            .collect()
    }

    /// Ids of sessions that should be stopped on shutdown
    pub async fn live_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| {
                !matches!(s.status, SessionStatus::Terminated | SessionStatus::Starting)
            })
            .map(|s| s.id.clone())
            .collect()
    }

    /// Drop terminated records whose termination is older than `older_than`
    pub async fn purge_terminated(&self, older_than: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| {
            !(s.status == SessionStatus::Terminated
                && s.terminated_at.is_some_and(|t| t < older_than))
        });
        before - sessions.len()
    }
}

fn apply_transition(session: &mut Session, next: SessionStatus) -> Result<()> {
    if !session.status.can_transition_to(next) {
        return Err(SandboxError::State(format!(
            "Session {} cannot move from {} to {}",
            session.id, session.status, next
        )));
    }
    debug!(session_id = %session.id, "Session {} -> {}", session.status, next);
    session.status = next;
    Ok(())
}
