// ABOUTME: Docker implementation of the ContainerEngine trait via bollard
// ABOUTME: Translates SandboxSpec into container configs and forwards output streams

use super::{
    BindMount, ContainerEngine, EngineError, OutputChunk, OutputStream, Result, SandboxSpec,
    StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
        ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, error, info};

pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the local daemon using the environment's defaults.
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing connection.
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    fn to_container_config(spec: &SandboxSpec) -> Config<String> {
        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|BindMount { host_path, container_path, readonly }| {
                format!(
                    "{}:{}:{}",
                    host_path,
                    container_path,
                    if *readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let ulimits: Vec<bollard::models::ResourcesUlimits> = spec
            .ulimits
            .iter()
            .map(|u| bollard::models::ResourcesUlimits {
                name: Some(u.name.clone()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: Some(spec.memory_bytes),
            cpu_quota: Some(spec.cpu_quota),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            auto_remove: Some(spec.auto_remove),
            tmpfs: if spec.tmpfs.is_empty() {
                None
            } else {
                Some(spec.tmpfs.clone())
            },
            ulimits: if ulimits.is_empty() {
                None
            } else {
                Some(ulimits)
            },
            security_opt: spec
                .no_new_privileges
                .then(|| vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Forward a bollard output stream into a channel so callers can apply
    /// their own deadline to each recv.
    fn forward_output<S>(stream: S) -> OutputStream
    where
        S: futures::Stream<Item = std::result::Result<LogOutput, BollardError>> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(log) => {
                        let (stream_type, data) = match log {
                            LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
                            LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
                            LogOutput::Console { message } => (StreamType::Stdout, message.to_vec()),
                            _ => continue,
                        };

                        if tx.send(OutputChunk { stream: stream_type, data }).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => {
                        error!("Error streaming container output: {}", e);
                        break;
                    }
                }
            }
        });

        OutputStream { receiver: rx }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        info!(name = %spec.name, image = %spec.image, "Creating sandbox container");

        let config = Self::to_container_config(spec);
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| EngineError::Container(e.to_string()))?;

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::Container(e.to_string()))?;

        debug!(container_id = %container.id, "Sandbox container started");
        Ok(container.id)
    }

    async fn stop_sandbox(&self, container_id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_secs };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            // Already stopped is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(EngineError::Container(e.to_string())),
        }
    }

    async fn kill_sandbox(&self, container_id: &str) -> Result<()> {
        match self
            .client
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            // Gone or not running both mean there is nothing left to kill
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container already gone");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(EngineError::Container(e.to_string())),
        }
    }

    async fn remove_sandbox(&self, container_id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true, // Remove anonymous volumes
            ..Default::default()
        };
        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            // Already removed is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(EngineError::Container(e.to_string())),
        }
    }

    async fn list_labeled(&self, labels: &HashMap<String, String>) -> Result<Vec<String>> {
        // All key=value pairs go into one "label" filter entry, which the
        // engine treats as a conjunction.
        let label_filters: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);

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

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn put_archive(
        &self,
        container_id: &str,
        dest_path: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest_path.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(|e| EngineError::Archive(e.to_string()))?;

        Ok(())
    }

    async fn fetch_file(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let mut stream = self
            .client
            .download_from_container(container_id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => EngineError::NotFound(format!("{} not present in container", path)),
                other => EngineError::Archive(other.to_string()),
            })?;
            data.extend_from_slice(&bytes);
        }

        let file_name = path.rsplit('/').next().unwrap_or(path);
        super::file_from_tar(&data, file_name)
    }

    async fn exec_streamed(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
    ) -> Result<OutputStream> {
        debug!(container_id, ?command, "Executing command in sandbox");

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            env: if env.is_empty() { None } else { Some(env) },
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?;

        match start_result {
            StartExecResults::Attached { output, .. } => Ok(Self::forward_output(output)),
            StartExecResults::Detached => Err(EngineError::Exec(
                "Exec was detached unexpectedly".to_string(),
            )),
        }
    }

    async fn stream_logs(&self, container_id: &str, follow: bool) -> Result<OutputStream> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            ..Default::default()
        };

        let logs = self.client.logs(container_id, Some(options));
        Ok(Self::forward_output(logs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UlimitSpec;

    fn sample_spec() -> SandboxSpec {
        SandboxSpec {
            name: "vitrine-test".to_string(),
            image: "kivy-renderer:prewarmed".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            env_vars: HashMap::from([("DISPLAY".to_string(), ":99".to_string())]),
            working_dir: Some("/work".to_string()),
            labels: HashMap::from([("vitrine.app".to_string(), "vitrine".to_string())]),
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 50_000,
            network_disabled: true,
            auto_remove: false,
            binds: vec![BindMount {
                host_path: "/tmp/run".to_string(),
                container_path: "/work".to_string(),
                readonly: false,
            }],
            tmpfs: HashMap::from([("/tmp".to_string(), "size=80m,noexec".to_string())]),
            ulimits: vec![UlimitSpec {
                name: "fsize".to_string(),
                soft: 104_857_600,
                hard: 104_857_600,
            }],
            no_new_privileges: true,
        }
    }

    #[test]
    fn test_container_config_carries_resource_ceilings() {
        let config = DockerEngine::to_container_config(&sample_spec());
        let host = config.host_config.expect("host config");

        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.auto_remove, Some(false));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        let ulimits = host.ulimits.expect("ulimits");
        assert_eq!(ulimits[0].name.as_deref(), Some("fsize"));
        assert_eq!(ulimits[0].hard, Some(104_857_600));
    }

    #[test]
    fn test_container_config_formats_binds_and_env() {
        let config = DockerEngine::to_container_config(&sample_spec());
        let host = config.host_config.expect("host config");

        assert_eq!(host.binds, Some(vec!["/tmp/run:/work:rw".to_string()]));
        assert_eq!(config.env, Some(vec!["DISPLAY=:99".to_string()]));
        assert_eq!(config.working_dir.as_deref(), Some("/work"));
    }

    #[test]
    fn test_network_stays_default_when_not_disabled() {
        let mut spec = sample_spec();
        spec.network_disabled = false;
        spec.binds.clear();
        spec.tmpfs.clear();
        spec.ulimits.clear();

        let config = DockerEngine::to_container_config(&spec);
        let host = config.host_config.expect("host config");
        assert_eq!(host.network_mode, None);
        assert_eq!(host.binds, None);
        assert_eq!(host.tmpfs, None);
        assert_eq!(host.ulimits, None);
    }
}
