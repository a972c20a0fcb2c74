// ABOUTME: Docker engine implementation backed by the bollard client
// ABOUTME: Hardened container creation, tar-based file writes, attached exec and pidfile-based kill

use super::{
    ContainerConfig, ContainerInfo, ContainerStatus, Engine, EngineError, EngineResult,
    ExecHandle, OutputChunk, OutputStream, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions},
    Docker,
};
use crate::settings::managed_label;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

const PIDFILE_DIR: &str = "/tmp";

pub struct DockerEngine {
    client: Docker,
    label_prefix: String,
}

impl DockerEngine {
    /// Connect using the platform defaults (DOCKER_HOST or the local socket)
    pub fn connect(label_prefix: &str) -> EngineResult<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, label_prefix))
    }

    pub fn with_client(client: Docker, label_prefix: &str) -> Self {
        Self {
            client,
            label_prefix: label_prefix.to_string(),
        }
    }

    fn to_bollard_config(&self, config: &ContainerConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(managed_label(&self.label_prefix), "true".to_string());
        labels.insert(format!("{}.name", self.label_prefix), config.name.clone());

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for port in &config.published_ports {
            let container_port = format!("{}/tcp", port);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            // Empty host port lets the daemon pick a free ephemeral port
            let binding = vec![bollard::models::PortBinding {
                host_ip: Some(config.publish_host_ip.clone()),
                host_port: Some(String::new()),
            }];
            port_bindings.insert(container_port, Some(binding));
        }

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            nano_cpus: Some((config.cpu_limit * 1_000_000_000.0) as i64),
            memory: Some(config.mem_limit_bytes as i64),
            memory_swap: Some(config.mem_limit_bytes as i64),
            pids_limit: Some(config.pids_limit),
            network_mode: Some(config.network_mode.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            privileged: Some(false),
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: Some(config.command.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn pidfile(process_tag: &str) -> String {
        format!("{}/.sandkeep-exec-{}.pid", PIDFILE_DIR, process_tag)
    }

    /// Wrap a command so the shell records its pid before exec'ing the real process
    fn wrap_with_pidfile(process_tag: &str, command: Vec<String>) -> Vec<String> {
        let mut wrapped = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {} && exec \"$@\"", Self::pidfile(process_tag)),
            "sandkeep-exec".to_string(),
        ];
        wrapped.extend(command);
        wrapped
    }

    async fn run_to_completion(&self, container_id: &str, command: Vec<String>) -> EngineResult<()> {
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_container_error(container_id, e))?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    if let Err(e) = msg {
                        return Err(EngineError::Exec(e.to_string()));
                    }
                }
                Ok(())
            }
            StartExecResults::Detached => Ok(()),
        }
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_container_error(container_id: &str, e: bollard::errors::Error) -> EngineError {
    if is_not_found(&e) {
        EngineError::NotFound(format!("container {}", container_id))
    } else {
        EngineError::Container(e.to_string())
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Connection(e.to_string()))
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(EngineError::Image(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        info!("Pulling image: {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_status = String::new();

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| {
                EngineError::Image(format!("Failed to pull image {}: {}", image, e))
            })?;
            if let Some(status) = &info.status {
                if status != &last_status {
                    debug!("Pull status: {}", status);
                    last_status = status.clone();
                }
            }
            if let Some(error) = info.error {
                return Err(EngineError::Image(format!(
                    "Failed to pull image {}: {}",
                    image, error
                )));
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        labels: HashMap<String, String>,
    ) -> EngineResult<()> {
        info!("Building image: {}", tag);

        let context = single_file_tar("Dockerfile", dockerfile.as_bytes(), 0o644)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            labels,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(context.into()));
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| {
                EngineError::Image(format!("Failed to build image {}: {}", tag, e))
            })?;
            if let Some(line) = info.stream.as_deref().map(str::trim) {
                if !line.is_empty() {
                    debug!("Build: {}", line);
                }
            }
            if let Some(error) = info.error {
                return Err(EngineError::Image(format!(
                    "Failed to build image {}: {}",
                    tag, error
                )));
            }
        }

        info!("Successfully built image: {}", tag);
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> EngineResult<String> {
        info!("Creating container: {}", config.name);

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(config))
            .await
            .map_err(|e| EngineError::Container(e.to_string()))?;

        for warning in &container.warnings {
            warn!("Container {} created with warning: {}", container.id, warning);
        }
        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> EngineResult<()> {
        info!("Starting container: {}", container_id);

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_container_error(container_id, e))
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> EngineResult<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_container_error(container_id, e)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> EngineResult<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| map_container_error(container_id, e))
    }

    async fn inspect_container(&self, container_id: &str) -> EngineResult<ContainerInfo> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| map_container_error(container_id, e))?;

        let status = inspect
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|s| ContainerStatus::from_state(s.as_ref()))
            .unwrap_or_else(|| ContainerStatus::Unknown("no state".to_string()));

        let mut ports = HashMap::new();
        if let Some(port_map) = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
        {
            for (container_port_str, bindings) in port_map {
                let host_port = bindings
                    .as_ref()
                    .and_then(|b| b.first())
                    .and_then(|b| b.host_port.as_ref())
                    .and_then(|p| p.parse::<u16>().ok());
                // Format: "7681/tcp"
                let container_port = container_port_str
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
                    ports.insert(container_port, host_port);
                }
            }
        }

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| container_id.to_string()),
            name: inspect
                .name
                .unwrap_or_else(|| container_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            ports,
            labels,
            created_at,
        })
    }

    async fn list_managed_containers(&self) -> EngineResult<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", managed_label(&self.label_prefix))],
        );

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::Container(e.to_string()))?;

        let mut infos = Vec::new();
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.inspect_container(&id).await {
                Ok(info) => infos.push(info),
                // Removed between list and inspect
                Err(EngineError::NotFound(_)) => {}
                Err(e) => warn!("Failed to inspect container {}: {}", id, e),
            }
        }

        Ok(infos)
    }

    async fn write_file(
        &self,
        container_id: &str,
        path: &str,
        contents: &[u8],
    ) -> EngineResult<()> {
        let (dir, file_name) = match path.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => {
                return Err(EngineError::Config(format!(
                    "File path must be absolute: {}",
                    path
                )))
            }
        };
        if file_name.is_empty() {
            return Err(EngineError::Config(format!(
                "File path has no file name: {}",
                path
            )));
        }

        debug!(
            container_id = %container_id,
            "Writing {} bytes to {}",
            contents.len(),
            path
        );

        let archive = single_file_tar(file_name, contents, 0o644)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(|e| map_container_error(container_id, e))
    }

    async fn exec_attached(
        &self,
        container_id: &str,
        command: Vec<String>,
    ) -> EngineResult<ExecHandle> {
        let process_tag = uuid::Uuid::new_v4().simple().to_string();
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(Self::wrap_with_pidfile(&process_tag, command)),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_container_error(container_id, e))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?;

        let mut output = match start_result {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(EngineError::Exec(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let exec_id = exec.id.clone();

        tokio::spawn(async move {
            while let Some(result) = output.next().await {
                let chunk = match result {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        OutputChunk {
                            stream: StreamType::Stdout,
                            data: message.to_vec(),
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => OutputChunk {
                        stream: StreamType::Stderr,
                        data: message.to_vec(),
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Error streaming exec {} output: {}", exec_id, e);
                        break;
                    }
                };
                if tx.send(chunk).is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(ExecHandle {
            exec_id: exec.id,
            process_tag,
            output: OutputStream { receiver: rx },
        })
    }

    async fn exec_detached(&self, container_id: &str, command: Vec<String>) -> EngineResult<String> {
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_container_error(container_id, e))?;

        self.client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?;

        Ok(exec.id)
    }

    async fn kill_exec(&self, container_id: &str, process_tag: &str) -> EngineResult<()> {
        let pidfile = Self::pidfile(process_tag);
        // Children first so nothing is re-parented and left running
        let script = format!(
            "p=$(cat {pidfile} 2>/dev/null); \
             if [ -n \"$p\" ]; then \
               for c in $(cat /proc/$p/task/*/children 2>/dev/null); do kill -KILL $c 2>/dev/null; done; \
               pkill -KILL -P $p 2>/dev/null; \
               kill -KILL $p 2>/dev/null; \
             fi; \
             rm -f {pidfile}",
            pidfile = pidfile
        );

        info!(
            container_id = %container_id,
            "Killing exec process {}", process_tag
        );

        self.run_to_completion(
            container_id,
            vec!["sh".to_string(), "-c".to_string(), script],
        )
        .await
    }

    async fn exec_exit_code(&self, exec_id: &str) -> EngineResult<Option<i64>> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?;

        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }
}

/// In-memory tar archive holding one regular file
fn single_file_tar(name: &str, contents: &[u8], mode: u32) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    archive.append_data(&mut header, name, contents)?;
    archive.into_inner()
}
