// ABOUTME: Code executor: writes code into a running sandbox and runs it under a deadline
// ABOUTME: Captures bounded stdout/stderr, kills only the in-sandbox process on timeout

use crate::engine::{Engine, EngineError, StreamType};
use crate::error::{Result, SandboxError};
use crate::languages::{LanguageConfig, LanguageSpec};
use crate::lifecycle::LifecycleManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How long `kill_exec` may take before the execution reports an engine timeout
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Output still collected after a kill
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const EXIT_CODE_POLLS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionTarget {
    /// An already-running session
    Session { session_id: String },
    /// A throwaway session started for this run and always stopped afterwards
    Ephemeral {
        registry_name: String,
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub target: ExecutionTarget,
    pub language: String,
    pub code: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the run was killed at its deadline
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
}

/// Accumulates one output stream up to a byte ceiling
struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_string(self) -> (String, bool) {
        (String::from_utf8_lossy(&self.data).into_owned(), self.truncated)
    }
}

struct RawOutcome {
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    exit_code: Option<i64>,
    timed_out: bool,
    duration: Duration,
    /// Set when a timed-out process could not be killed
    kill_error: Option<EngineError>,
}

pub struct CodeExecutor {
    lifecycle: Arc<LifecycleManager>,
    languages: Arc<LanguageConfig>,
    session_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CodeExecutor {
    pub fn new(lifecycle: Arc<LifecycleManager>, languages: Arc<LanguageConfig>) -> Self {
        Self {
            lifecycle,
            languages,
            session_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Run `code` in an existing session
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        language: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let spec = self.languages.resolve(language)?.clone();

        let settings = self.lifecycle.settings();
        if code.len() > settings.max_code_bytes {
            return Err(SandboxError::Resource(format!(
                "Code is {} bytes, limit is {}",
                code.len(),
                settings.max_code_bytes
            )));
        }
        let timeout = settings.exec_timeout(timeout);

        self.prune_session_locks().await;

        // Same-session executions run one at a time
        let outcome = {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().await;
            self.execute_locked(session_id, &spec, code, timeout).await
        };

        let tracker = self.lifecycle.tracker();
        if !tracker
            .get(session_id)
            .await
            .is_some_and(|s| s.status.is_live())
        {
            self.release_session_lock(session_id);
        }

        let outcome = outcome?;
        let (stdout, stdout_truncated) = outcome.stdout.into_string();
        let (stderr, stderr_truncated) = outcome.stderr.into_string();

        info!(
            session_id = %session_id,
            "Execution finished in {}ms (exit: {:?}, timed out: {})",
            outcome.duration.as_millis(),
            outcome.exit_code,
            outcome.timed_out
        );

        Ok(ExecutionResult {
            session_id: session_id.to_string(),
            stdout,
            stderr,
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration.as_millis() as u64,
            stdout_truncated,
            stderr_truncated,
            timed_out: outcome.timed_out,
        })
    }

    async fn execute_locked(
        &self,
        session_id: &str,
        spec: &LanguageSpec,
        code: &str,
        timeout: Duration,
    ) -> Result<RawOutcome> {
        let tracker = self.lifecycle.tracker();
        let container_id = tracker.begin_execution(session_id).await?;

        debug!(
            session_id = %session_id,
            "Executing {} bytes of {} (timeout: {:?})",
            code.len(),
            spec.name,
            timeout
        );

        let outcome = self.run_in_container(&container_id, spec, code, timeout).await;

        if let Err(e) = tracker.end_execution(session_id).await {
            warn!(session_id = %session_id, "Failed to finish execution bookkeeping: {}", e);
        }

        let mut outcome = outcome?;
        if let Some(kill_error) = outcome.kill_error.take() {
            // A process that could not be killed may still be running; retire the sandbox
            error!(session_id = %session_id, "Could not kill timed-out process: {}", kill_error);
            if let Err(e) = tracker
                .fail(session_id, format!("Failed to kill timed-out process: {}", kill_error))
                .await
            {
                warn!(session_id = %session_id, "Failed to mark session as errored: {}", e);
            }
            if let Err(e) = self.lifecycle.stop(session_id, "kill failed").await {
                warn!(session_id = %session_id, "Failed to stop session after kill failure: {}", e);
            }
            return Err(kill_error.into());
        }
        Ok(outcome)
    }

    /// Run a request against an existing or ephemeral session
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        match request.target {
            ExecutionTarget::Session { session_id } => {
                self.execute(&session_id, &request.code, &request.language, request.timeout)
                    .await
            }
            ExecutionTarget::Ephemeral {
                registry_name,
                ttl_secs,
            } => {
                // Validate before paying for a container
                self.languages.resolve(&request.language)?;

                let session = self
                    .lifecycle
                    .start(
                        &registry_name,
                        Some(&request.language),
                        ttl_secs.map(Duration::from_secs),
                    )
                    .await?;

                let result = self
                    .execute(&session.id, &request.code, &request.language, request.timeout)
                    .await;

                if let Err(e) = self.lifecycle.stop(&session.id, "ephemeral run finished").await {
                    warn!(session_id = %session.id, "Failed to stop ephemeral session: {}", e);
                }
                result
            }
        }
    }

    async fn run_in_container(
        &self,
        container_id: &str,
        spec: &LanguageSpec,
        code: &str,
        timeout: Duration,
    ) -> Result<RawOutcome> {
        let engine = self.lifecycle.engine().get().await?;
        let max_output = self.lifecycle.settings().max_output_bytes;

        engine
            .write_file(container_id, &spec.file_path, code.as_bytes())
            .await?;

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut handle = engine.exec_attached(container_id, spec.invocation()).await?;

        let mut stdout = CappedBuffer::new(max_output);
        let mut stderr = CappedBuffer::new(max_output);
        let mut timed_out = false;
        let mut kill_error = None;

        loop {
            tokio::select! {
                chunk = handle.output.receiver.recv() => match chunk {
                    Some(chunk) => match chunk.stream {
                        StreamType::Stdout => stdout.push(&chunk.data),
                        StreamType::Stderr => stderr.push(&chunk.data),
                    },
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            warn!(
                container_id = %container_id,
                "Execution exceeded {:?}, killing process", timeout
            );
            match tokio::time::timeout(
                KILL_GRACE,
                engine.kill_exec(container_id, &handle.process_tag),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => kill_error = Some(e),
                Err(_) => {
                    kill_error = Some(EngineError::Timeout(format!(
                        "killing process in {} took longer than {:?}",
                        container_id, KILL_GRACE
                    )))
                }
            }

            let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
            loop {
                tokio::select! {
                    chunk = handle.output.receiver.recv() => match chunk {
                        Some(chunk) => match chunk.stream {
                            StreamType::Stdout => stdout.push(&chunk.data),
                            StreamType::Stderr => stderr.push(&chunk.data),
                        },
                        None => break,
                    },
                    _ = tokio::time::sleep_until(drain_deadline) => break,
                }
            }
            None
        } else {
            wait_for_exit_code(engine.as_ref(), &handle.exec_id).await?
        };

        Ok(RawOutcome {
            stdout,
            stderr,
            exit_code,
            timed_out,
            duration: started.elapsed(),
            kill_error,
        })
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for a session unless another caller still holds it
    fn release_session_lock(&self, session_id: &str) {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
    }

    /// Drop lock entries of sessions that were stopped or swept since their last run
    async fn prune_session_locks(&self) {
        let idle: Vec<String> = {
            let locks = self
                .session_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locks
                .iter()
                .filter(|(_, lock)| Arc::strong_count(lock) == 1)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let tracker = self.lifecycle.tracker();
        for session_id in idle {
            if !tracker
                .get(&session_id)
                .await
                .is_some_and(|s| s.status.is_live())
            {
                self.release_session_lock(&session_id);
            }
        }
    }
}

/// The stream can close slightly before the engine records the exit code
async fn wait_for_exit_code(engine: &dyn Engine, exec_id: &str) -> Result<Option<i64>> {
    for _ in 0..EXIT_CODE_POLLS {
        if let Some(code) = engine.exec_exit_code(exec_id).await? {
            return Ok(Some(code));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    warn!("Exec {} closed its output but reported no exit code", exec_id);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineClient;
    use crate::registry::{NetworkPolicy, Registry};
    use crate::settings::SandboxSettings;
    use crate::testing::{sample_entry, MockEngine};
    use crate::tracking::SessionTracker;
    use pretty_assertions::assert_eq;

    fn executor_with(engine: Arc<MockEngine>, settings: SandboxSettings) -> CodeExecutor {
        let languages = Arc::new(LanguageConfig::builtin().unwrap());
        let registry =
            Registry::from_entries(vec![sample_entry("python-small", NetworkPolicy::None)])
                .unwrap();
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(settings),
            Arc::new(registry),
            languages.clone(),
            Arc::new(EngineClient::with_engine(engine)),
            Arc::new(SessionTracker::new()),
        ));
        CodeExecutor::new(lifecycle, languages)
    }

    #[test]
    fn test_capped_buffer_truncates() {
        let mut buffer = CappedBuffer::new(5);
        buffer.push(b"abc");
        buffer.push(b"defg");
        buffer.push(b"h");
        let (text, truncated) = buffer.into_string();
        assert_eq!(text, "abcde");
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_execute_captures_both_streams() {
        let engine = Arc::new(MockEngine::new());
        let executor = executor_with(engine, SandboxSettings::default());
        let session = executor
            .lifecycle
            .start("python-small", None, None)
            .await
            .unwrap();

        let result = executor
            .execute(&session.id, "print hello\neprint oops\nexit 3", "python", None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let engine = Arc::new(MockEngine::new());
        let executor = executor_with(engine, SandboxSettings::default());
        let err = executor
            .execute("whatever", "print x", "cobol", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }

    #[tokio::test]
    async fn test_oversized_code_rejected() {
        let engine = Arc::new(MockEngine::new());
        let settings = SandboxSettings {
            max_code_bytes: 8,
            ..SandboxSettings::default()
        };
        let executor = executor_with(engine, settings);
        let err = executor
            .execute("whatever", "print much too long", "python", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Resource(_)));
    }

    #[tokio::test]
    async fn test_output_ceiling_sets_truncated_flag() {
        let engine = Arc::new(MockEngine::new());
        let settings = SandboxSettings {
            max_output_bytes: 1000,
            ..SandboxSettings::default()
        };
        let executor = executor_with(engine, settings);
        let session = executor
            .lifecycle
            .start("python-small", None, None)
            .await
            .unwrap();

        let result = executor
            .execute(&session.id, "spam 50000", "python", None)
            .await
            .unwrap();
        assert_eq!(result.stdout.len(), 1000);
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_but_keeps_session() {
        let engine = Arc::new(MockEngine::new());
        let executor = executor_with(engine.clone(), SandboxSettings::default());
        let session = executor
            .lifecycle
            .start("python-small", None, None)
            .await
            .unwrap();

        let result = executor
            .execute(
                &session.id,
                "print before\nloop",
                "python",
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.stdout, "before\n");
        assert_eq!(engine.kill_count(), 1);

        // Sandbox survives the timeout
        let again = executor
            .execute(&session.id, "print after", "python", None)
            .await
            .unwrap();
        assert_eq!(again.stdout, "after\n");
    }

    #[tokio::test]
    async fn test_ephemeral_run_always_stops() {
        let engine = Arc::new(MockEngine::new());
        let executor = executor_with(engine.clone(), SandboxSettings::default());

        let result = executor
            .run(ExecutionRequest {
                target: ExecutionTarget::Ephemeral {
                    registry_name: "python-small".to_string(),
                    ttl_secs: None,
                },
                language: "python".to_string(),
                code: "print once".to_string(),
                timeout: None,
            })
            .await
            .unwrap();
        assert_eq!(result.stdout, "once\n");
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_still_ends_execution() {
        let engine = Arc::new(MockEngine::new());
        let executor = executor_with(engine.clone(), SandboxSettings::default());
        let session = executor
            .lifecycle
            .start("python-small", None, None)
            .await
            .unwrap();

        engine.fail_writes(true);
        let err = executor
            .execute(&session.id, "print x", "python", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Engine(_)));

        let snapshot = executor
            .lifecycle
            .get_session(&session.id)
            .await
            .unwrap();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.status, crate::tracking::SessionStatus::Idle);
    }

    fn lock_entries(executor: &CodeExecutor) -> usize {
        executor.session_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_session_locks_do_not_accumulate() {
        let engine = Arc::new(MockEngine::new());
        let executor = executor_with(engine, SandboxSettings::default());
        let session = executor
            .lifecycle
            .start("python-small", None, None)
            .await
            .unwrap();
        executor
            .execute(&session.id, "print hi", "python", None)
            .await
            .unwrap();
        assert_eq!(lock_entries(&executor), 1);

        let report = executor
            .lifecycle
            .sweep_at(chrono::Utc::now() + chrono::Duration::days(1))
            .await;
        assert_eq!(report.stopped, 1);

        for i in 0..1000 {
            let err = executor
                .execute(&format!("no-such-session-{}", i), "print x", "python", None)
                .await
                .unwrap_err();
            assert!(matches!(err, SandboxError::SessionNotFound(_)));
        }
        assert_eq!(lock_entries(&executor), 0);

        let err = executor
            .execute(&session.id, "print again", "python", None)
            .await
            .unwrap_err();
        // The sweep may already have purged the record
        assert!(matches!(
            err,
            SandboxError::SessionNotRunning { .. } | SandboxError::SessionNotFound(_)
        ));
        assert_eq!(lock_entries(&executor), 0);
    }

    #[tokio::test]
    async fn test_failed_kill_retires_session() {
        let engine = Arc::new(MockEngine::new());
        let executor = executor_with(engine.clone(), SandboxSettings::default());
        let session = executor
            .lifecycle
            .start("python-small", None, None)
            .await
            .unwrap();

        engine.fail_kills(true);
        let err = executor
            .execute(&session.id, "loop", "python", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Engine(EngineError::Exec(_))));
        assert_eq!(engine.kill_count(), 1);

        let snapshot = executor
            .lifecycle
            .get_session(&session.id)
            .await
            .unwrap();
        assert_eq!(snapshot.status, crate::tracking::SessionStatus::Terminated);
        assert!(snapshot
            .error
            .as_deref()
            .is_some_and(|e| e.contains("injected kill failure")));
        assert_eq!(engine.running_count(), 0);
        assert_eq!(lock_entries(&executor), 0);
    }
}
