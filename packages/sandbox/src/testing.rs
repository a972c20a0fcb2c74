// ABOUTME: In-memory Engine implementation and fixtures for tests without a container daemon
// ABOUTME: Exec interprets a tiny line-based script read from the code file written into the container

use crate::engine::{
    ContainerConfig, ContainerInfo, ContainerStatus, Engine, EngineError, EngineResult,
    ExecHandle, OutputChunk, OutputStream, StreamType,
};
use crate::registry::{NetworkPolicy, RegistryEntry};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

const FIRST_HOST_PORT: u16 = 40000;
const KILLED_EXIT_CODE: i64 = 137;
const SPAM_CHUNK: usize = 4096;

/// A registry entry suitable for tests: allows python and sh
pub fn sample_entry(name: &str, network_policy: NetworkPolicy) -> RegistryEntry {
    RegistryEntry {
        name: name.to_string(),
        aliases: Vec::new(),
        image: "python:3.12-slim".to_string(),
        build: None,
        cpu_limit: 0.5,
        mem_limit_bytes: 256 * 1024 * 1024,
        pids_limit: 128,
        network_policy,
        default_ttl_secs: 300,
        languages: vec!["python".to_string(), "sh".to_string()],
        terminal_port: None,
        env: BTreeMap::new(),
    }
}

struct MockContainer {
    name: String,
    labels: HashMap<String, String>,
    running: bool,
    ports: HashMap<u16, u16>,
    files: HashMap<String, Vec<u8>>,
    detached: Vec<Vec<String>>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    images: HashSet<String>,
    exec_exit_codes: HashMap<String, Option<i64>>,
    processes: HashMap<String, CancellationToken>,
    next_port: u16,
    next_id: u64,
    failing_creates: usize,
    failing_pulls: usize,
    image_delay: Duration,
    next_ping_delay: Option<Duration>,
}

/// Engine double that keeps containers, files and processes in memory.
///
/// Code files are interpreted line by line:
/// `print <text>`, `eprint <text>`, `sleep <ms>`, `loop` (until killed),
/// `spam <bytes>` and `exit <code>`.
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    available: AtomicBool,
    fail_removes: AtomicBool,
    fail_inspects: AtomicBool,
    fail_writes: AtomicBool,
    fail_kills: AtomicBool,
    creates: AtomicUsize,
    removes: AtomicUsize,
    pulls: AtomicUsize,
    builds: AtomicUsize,
    kills: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_port: FIRST_HOST_PORT,
                ..Default::default()
            })),
            available: AtomicBool::new(true),
            fail_removes: AtomicBool::new(false),
            fail_inspects: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_kills: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    /// Delay applied to every pull and build
    pub fn set_image_delay(&self, delay: Duration) {
        self.state().image_delay = delay;
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.state().failing_creates = count;
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inspects(&self, fail: bool) {
        self.fail_inspects.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_pulls(&self, count: usize) {
        self.state().failing_pulls = count;
    }

    pub fn fail_kills(&self, fail: bool) {
        self.fail_kills.store(fail, Ordering::SeqCst);
    }

    /// Make only the next ping take `delay`
    pub fn delay_next_ping(&self, delay: Duration) {
        self.state().next_ping_delay = Some(delay);
    }

    /// A running managed container no session knows about
    pub fn add_orphan(&self, id: &str) {
        self.state().containers.insert(
            id.to_string(),
            MockContainer {
                name: id.to_string(),
                labels: HashMap::new(),
                running: true,
                ports: HashMap::new(),
                files: HashMap::new(),
                detached: Vec::new(),
            },
        );
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.state().containers.contains_key(id)
    }

    pub fn running_count(&self) -> usize {
        self.state().containers.values().filter(|c| c.running).count()
    }

    pub fn container_labels(&self, id: &str) -> Option<HashMap<String, String>> {
        self.state().containers.get(id).map(|c| c.labels.clone())
    }

    pub fn file_contents(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.state()
            .containers
            .get(id)
            .and_then(|c| c.files.get(path).cloned())
    }

    pub fn detached_commands(&self, id: &str) -> Vec<Vec<String>> {
        self.state()
            .containers
            .get(id)
            .map(|c| c.detached.clone())
            .unwrap_or_default()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    fn running_container<'a>(
        state: &'a mut MockState,
        id: &str,
    ) -> EngineResult<&'a mut MockContainer> {
        match state.containers.get_mut(id) {
            Some(c) if c.running => Ok(c),
            Some(_) => Err(EngineError::Container(format!("container {} is not running", id))),
            None => Err(EngineError::NotFound(format!("container {}", id))),
        }
    }

    async fn image_work(&self, image: &str) {
        let delay = self.state().image_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state().images.insert(image.to_string());
    }
}

fn send(tx: &UnboundedSender<OutputChunk>, stream: StreamType, data: Vec<u8>) {
    let _ = tx.send(OutputChunk { stream, data });
}

/// Interpret a mock script; returns the exit code
async fn run_script(script: String, tx: UnboundedSender<OutputChunk>, killed: CancellationToken) -> i64 {
    for line in script.lines() {
        let line = line.trim();
        let (op, arg) = line.split_once(' ').unwrap_or((line, ""));
        match op {
            "" => {}
            "print" => send(&tx, StreamType::Stdout, format!("{}\n", arg).into_bytes()),
            "eprint" => send(&tx, StreamType::Stderr, format!("{}\n", arg).into_bytes()),
            "sleep" => {
                let ms = arg.trim().parse().unwrap_or(0);
                tokio::select! {
                    _ = killed.cancelled() => return KILLED_EXIT_CODE,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
            "loop" => {
                killed.cancelled().await;
                return KILLED_EXIT_CODE;
            }
            "spam" => {
                let mut remaining: usize = arg.trim().parse().unwrap_or(0);
                while remaining > 0 {
                    let n = remaining.min(SPAM_CHUNK);
                    send(&tx, StreamType::Stdout, vec![b'x'; n]);
                    remaining -= n;
                }
            }
            "exit" => return arg.trim().parse().unwrap_or(1),
            other => {
                send(
                    &tx,
                    StreamType::Stderr,
                    format!("unknown command: {}\n", other).into_bytes(),
                );
                return 127;
            }
        }
        if killed.is_cancelled() {
            return KILLED_EXIT_CODE;
        }
    }
    0
}

#[async_trait]
impl Engine for MockEngine {
    async fn ping(&self) -> EngineResult<()> {
        let delay = self.state().next_ping_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Connection("mock engine offline".to_string()))
        }
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state();
            if state.failing_pulls > 0 {
                state.failing_pulls -= 1;
                return Err(EngineError::Image(format!("injected pull failure for {}", image)));
            }
        }
        self.image_work(image).await;
        Ok(())
    }

    async fn build_image(
        &self,
        tag: &str,
        _dockerfile: &str,
        _labels: HashMap<String, String>,
    ) -> EngineResult<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.image_work(tag).await;
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> EngineResult<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();

        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(EngineError::Container("injected create failure".to_string()));
        }
        if !state.images.contains(&config.image) {
            return Err(EngineError::Image(format!("no such image: {}", config.image)));
        }

        state.next_id += 1;
        let id = format!("mock-{:08}", state.next_id);

        let mut ports = HashMap::new();
        if config.network_mode != "none" {
            for port in &config.published_ports {
                ports.insert(*port, state.next_port);
                state.next_port += 1;
            }
        }

        state.containers.insert(
            id.clone(),
            MockContainer {
                name: config.name.clone(),
                labels: config.labels.clone(),
                running: false,
                ports,
                files: HashMap::new(),
                detached: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> EngineResult<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(format!("container {}", container_id)))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u64) -> EngineResult<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(format!("container {}", container_id)))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> EngineResult<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(EngineError::Container("injected remove failure".to_string()));
        }
        match self.state().containers.remove(container_id) {
            Some(_) => {
                self.removes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("container {}", container_id))),
        }
    }

    async fn inspect_container(&self, container_id: &str) -> EngineResult<ContainerInfo> {
        if self.fail_inspects.load(Ordering::SeqCst) {
            return Err(EngineError::Connection("injected inspect failure".to_string()));
        }
        let state = self.state();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| EngineError::NotFound(format!("container {}", container_id)))?;
        Ok(ContainerInfo {
            id: container_id.to_string(),
            name: container.name.clone(),
            status: if container.running {
                ContainerStatus::Running
            } else {
                ContainerStatus::Stopped
            },
            ports: container.ports.clone(),
            labels: container.labels.clone(),
            created_at: chrono::Utc::now(),
        })
    }

    async fn list_managed_containers(&self) -> EngineResult<Vec<ContainerInfo>> {
        let ids: Vec<String> = self.state().containers.keys().cloned().collect();
        let mut infos = Vec::new();
        for id in ids {
            infos.push(self.inspect_container(&id).await?);
        }
        Ok(infos)
    }

    async fn write_file(
        &self,
        container_id: &str,
        path: &str,
        contents: &[u8],
    ) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Container("injected write failure".to_string()));
        }
        let mut state = self.state();
        let container = Self::running_container(&mut state, container_id)?;
        container.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn exec_attached(
        &self,
        container_id: &str,
        command: Vec<String>,
    ) -> EngineResult<ExecHandle> {
        let mut state = self.state();
        let container = Self::running_container(&mut state, container_id)?;
        let script = command
            .last()
            .and_then(|path| container.files.get(path))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();

        let exec_id = uuid::Uuid::new_v4().to_string();
        let process_tag = uuid::Uuid::new_v4().simple().to_string();
        let killed = CancellationToken::new();
        state.exec_exit_codes.insert(exec_id.clone(), None);
        state.processes.insert(process_tag.clone(), killed.clone());
        drop(state);

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = self.state.clone();
        let (task_exec_id, task_tag) = (exec_id.clone(), process_tag.clone());
        tokio::spawn(async move {
            let code = run_script(script, tx.clone(), killed).await;
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            state.exec_exit_codes.insert(task_exec_id, Some(code));
            state.processes.remove(&task_tag);
            // Output closes only after the exit code is recorded
            drop(tx);
        });

        Ok(ExecHandle {
            exec_id,
            process_tag,
            output: OutputStream { receiver: rx },
        })
    }

    async fn exec_detached(&self, container_id: &str, command: Vec<String>) -> EngineResult<String> {
        let mut state = self.state();
        let container = Self::running_container(&mut state, container_id)?;
        container.detached.push(command);
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn kill_exec(&self, container_id: &str, process_tag: &str) -> EngineResult<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.fail_kills.load(Ordering::SeqCst) {
            return Err(EngineError::Exec("injected kill failure".to_string()));
        }
        let state = self.state();
        if !state.containers.contains_key(container_id) {
            return Err(EngineError::NotFound(format!("container {}", container_id)));
        }
        if let Some(token) = state.processes.get(process_tag) {
            token.cancel();
        }
        Ok(())
    }

    async fn exec_exit_code(&self, exec_id: &str) -> EngineResult<Option<i64>> {
        self.state()
            .exec_exit_codes
            .get(exec_id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("exec {}", exec_id)))
    }
}
