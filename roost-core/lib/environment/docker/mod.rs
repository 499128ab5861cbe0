//! Docker implementation of the environment adapter.
//!
//! Containers are named after the server uuid. The process-wide [`Docker`]
//! client is shared by every environment; per-server state here is limited to
//! the attached stdin handle and the event topics.

mod events;

use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, ResizeContainerTtyOptions,
        StartContainerOptions, WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::{ContainerStateStatusEnum, HostConfig, HostConfigLogConfig, PortBinding, ThrottleDevice},
    Docker,
};
use futures::StreamExt;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{broadcast, Mutex, RwLock},
};

use crate::{
    config::ConfigHandle,
    server::configuration::{ServerConfiguration, StopKind},
    RoostError, RoostResult,
};

use super::{Environment, EnvironmentEvents, ExitState, ImagePullStatus, SIGKILL};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Upper bound on a single image pull.
const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Mount point of the server data directory inside the container.
const CONTAINER_DATA_DIR: &str = "/home/container";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A Docker-backed server environment.
pub struct DockerEnvironment {
    docker: Arc<Docker>,
    uuid: String,
    configuration: Arc<RwLock<ServerConfiguration>>,
    node_config: ConfigHandle,
    data_dir: std::path::PathBuf,
    events: EnvironmentEvents,
    console: broadcast::Sender<String>,
    stdin: Mutex<Option<Pin<Box<dyn AsyncWrite + Send>>>>,
    attached: Arc<std::sync::atomic::AtomicBool>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerEnvironment {
    /// Creates the environment and spawns its runtime event consumer.
    pub fn new(
        docker: Arc<Docker>,
        uuid: uuid::Uuid,
        configuration: Arc<RwLock<ServerConfiguration>>,
        node_config: ConfigHandle,
        data_dir: std::path::PathBuf,
        console: broadcast::Sender<String>,
    ) -> Arc<Self> {
        let environment = Arc::new(Self {
            docker,
            uuid: uuid.to_string(),
            configuration,
            node_config,
            data_dir,
            events: EnvironmentEvents::new(),
            console,
            stdin: Mutex::new(None),
            attached: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });

        environment.spawn_event_loop();
        environment.spawn_stats_loop();

        environment
    }

    /// Pulls the configured image when it is not present locally, forwarding
    /// registry progress onto the image pull topic.
    async fn ensure_image(&self) -> RoostResult<()> {
        let (image, registries) = {
            let configuration = self.configuration.read().await;
            let node = self.node_config.snapshot();
            (
                configuration.image.clone(),
                node.get_docker().get_registries().clone(),
            )
        };

        if self.docker.inspect_image(&image).await.is_ok() {
            return Ok(());
        }

        let credentials = registries
            .iter()
            .find(|(registry, _)| image.starts_with(registry.as_str()))
            .map(|(registry, creds)| bollard::auth::DockerCredentials {
                username: Some(creds.get_username().clone()),
                password: Some(creds.get_password().clone()),
                serveraddress: Some(registry.clone()),
                ..Default::default()
            });

        tracing::info!(server = %self.uuid, image = %image, "pulling container image");

        let options = Some(CreateImageOptions {
            from_image: image.clone(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, credentials);
        let pull = async {
            while let Some(progress) = stream.next().await {
                let progress = progress?;
                self.events.publish_image_pull(ImagePullStatus {
                    status: progress.status.unwrap_or_default(),
                    progress: progress.progress.unwrap_or_default(),
                });
            }
            Ok::<(), RoostError>(())
        };

        match tokio::time::timeout(IMAGE_PULL_TIMEOUT, pull).await {
            Ok(result) => result,
            Err(_) => Err(RoostError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("image pull for {} timed out", image),
            ))),
        }
    }

    /// Builds the container and host configuration from the server document
    /// and the node configuration.
    async fn container_config(&self) -> Config<String> {
        let configuration = self.configuration.read().await;
        let node = self.node_config.snapshot();
        let limits = &configuration.build;

        let mut environment = configuration.environment_pairs();
        environment.push(format!("TZ={}", node.get_system().get_timezone()));

        let mut labels = configuration.labels.clone();
        labels.insert("Service".to_string(), "roost".to_string());
        labels.insert("ContainerType".to_string(), "server_process".to_string());

        let memory = node.get_docker().get_overhead().apply(limits.memory_bytes);
        let memory_swap = if limits.swap_bytes < 0 {
            -1
        } else if limits.memory_bytes > 0 {
            memory + limits.swap_bytes
        } else {
            0
        };

        let pids_limit = if limits.pid_limit > 0 {
            limits.pid_limit
        } else {
            *node.get_docker().get_container_pid_limit()
        };

        let mut binds = vec![format!("{}:{}", self.data_dir.display(), CONTAINER_DATA_DIR)];
        for mount in &configuration.mounts {
            let allowed = node
                .get_allowed_mounts()
                .iter()
                .any(|prefix| mount.source.starts_with(prefix));
            if !allowed {
                tracing::warn!(
                    server = %self.uuid,
                    source = %mount.source,
                    "skipping mount outside the allowed list"
                );
                continue;
            }

            let mode = if mount.read_only { "ro" } else { "rw" };
            binds.push(format!("{}:{}:{}", mount.source, mount.target, mode));
        }

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let allocation = &configuration.allocation;
        for port in std::iter::once(allocation.port).chain(allocation.additional_ports.iter().copied())
        {
            if port == 0 {
                continue;
            }
            for protocol in ["tcp", "udp"] {
                let key = format!("{}/{}", port, protocol);
                exposed_ports.insert(key.clone(), HashMap::new());
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some(allocation.ip.clone()),
                        host_port: Some(port.to_string()),
                    }]),
                );
            }
        }

        let blkio_device_read_bps = throttle_devices(&limits.blkio_device_limits, |d| d.read_bps);
        let blkio_device_write_bps = throttle_devices(&limits.blkio_device_limits, |d| d.write_bps);

        let host_config = HostConfig {
            binds: Some(binds),
            memory: (memory > 0).then_some(memory),
            memory_swap: (limits.memory_bytes > 0 || limits.swap_bytes < 0).then_some(memory_swap),
            cpu_quota: (limits.cpu_limit > 0).then_some(limits.cpu_limit * 1000),
            cpu_period: (limits.cpu_limit > 0).then_some(100_000),
            cpu_shares: Some(1024),
            blkio_weight: (limits.io_weight > 0).then_some(limits.io_weight),
            blkio_device_read_bps,
            blkio_device_write_bps,
            pids_limit: Some(pids_limit),
            network_mode: Some(node.get_docker().get_network().get_name().clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("rw,exec,nosuid,size={}M", node.get_docker().get_tmpfs_size()),
            )])),
            log_config: Some(HostConfigLogConfig {
                typ: Some(node.get_docker().get_log_config().get_driver().clone()),
                config: Some(node.get_docker().get_log_config().get_config().clone()),
            }),
            ..Default::default()
        };

        Config {
            hostname: Some(self.uuid.clone()),
            domainname: Some(node.get_docker().get_domainname().clone()),
            image: Some(configuration.image.clone()),
            env: Some(environment),
            labels: Some(labels),
            cmd: (!configuration.invocation.is_empty()).then(|| {
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    configuration.invocation.clone(),
                ]
            }),
            working_dir: Some(CONTAINER_DATA_DIR.to_string()),
            user: Some(format!(
                "{}:{}",
                node.get_system().get_user().get_uid(),
                node.get_system().get_user().get_gid()
            )),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(true),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Environment for DockerEnvironment {
    async fn exists(&self) -> RoostResult<bool> {
        match self.docker.inspect_container(&self.uuid, None).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create(&self) -> RoostResult<()> {
        if self.exists().await? {
            return Ok(());
        }

        self.ensure_image().await?;

        let config = self.container_config().await;
        let options = CreateContainerOptions {
            name: self.uuid.clone(),
            platform: None,
        };

        self.docker.create_container(Some(options), config).await?;
        tracing::debug!(server = %self.uuid, "created server container");

        Ok(())
    }

    async fn attach(&self) -> RoostResult<()> {
        use std::sync::atomic::Ordering;

        if self.attached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let options = AttachContainerOptions::<String> {
            stream: Some(true),
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            logs: Some(false),
            ..Default::default()
        };

        let results = match self.docker.attach_container(&self.uuid, Some(options)).await {
            Ok(results) => results,
            Err(err) => {
                self.attached.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        *self.stdin.lock().await = Some(results.input);
        self.spawn_output_reader(results.output);

        Ok(())
    }

    async fn start(&self) -> RoostResult<()> {
        if self.is_running().await? {
            return Ok(());
        }

        self.docker
            .start_container(&self.uuid, None::<StartContainerOptions<String>>)
            .await?;

        Ok(())
    }

    async fn stop(&self) -> RoostResult<()> {
        if !self.is_running().await? {
            return Ok(());
        }

        let stop = self.configuration.read().await.stop.clone();
        match stop.kind {
            StopKind::Signal => {
                self.docker
                    .kill_container(
                        &self.uuid,
                        Some(KillContainerOptions {
                            signal: stop.value.clone(),
                        }),
                    )
                    .await?;
            }
            StopKind::Command => {
                self.send_command(&stop.value).await?;
            }
        }

        self.wait_for_stop(Duration::from_secs(stop.timeout_seconds), true)
            .await
    }

    async fn terminate(&self, signal: &str) -> RoostResult<()> {
        if !self.is_running().await? {
            return Ok(());
        }

        self.docker
            .kill_container(&self.uuid, Some(KillContainerOptions { signal }))
            .await?;

        Ok(())
    }

    async fn wait_for_stop(
        &self,
        timeout: Duration,
        terminate_on_timeout: bool,
    ) -> RoostResult<()> {
        let wait = |condition: &'static str| {
            self.docker.wait_container(
                &self.uuid,
                Some(WaitContainerOptions { condition }),
            )
        };

        let mut stream = wait("not-running");
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Err(err))) if !is_not_found(&err) => Err(err.into()),
            Ok(_) => Ok(()),
            Err(_) if terminate_on_timeout => {
                tracing::warn!(
                    server = %self.uuid,
                    "container did not stop in time, escalating to SIGKILL"
                );
                self.terminate(SIGKILL).await?;

                match wait("not-running").next().await {
                    Some(Err(err)) if !is_not_found(&err) => Err(err.into()),
                    _ => Ok(()),
                }
            }
            Err(_) => Err(RoostError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "container did not stop within the allotted time",
            ))),
        }
    }

    async fn exit_state(&self) -> RoostResult<ExitState> {
        let inspect = self.docker.inspect_container(&self.uuid, None).await?;
        let state = inspect.state.unwrap_or_default();

        Ok(ExitState {
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn is_running(&self) -> RoostResult<bool> {
        match self.docker.inspect_container(&self.uuid, None).await {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.status)
                .map_or(false, |status| status == ContainerStateStatusEnum::RUNNING)),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_log(&self, lines: usize) -> RoostResult<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: lines.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(&self.uuid, Some(options));
        let mut collected = Vec::new();
        while let Some(output) = stream.next().await {
            let output = output?;
            for line in String::from_utf8_lossy(&output.into_bytes()).lines() {
                collected.push(line.trim_end_matches('\r').to_string());
            }
        }

        Ok(collected)
    }

    async fn send_command(&self, command: &str) -> RoostResult<()> {
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or_else(|| {
            RoostError::InvalidArgument(
                "cannot send a command to a server without an attached console".to_string(),
            )
        })?;

        writer.write_all(format!("{}\n", command).as_bytes()).await?;
        writer.flush().await?;

        Ok(())
    }

    async fn resize(&self, width: u16, height: u16) -> RoostResult<()> {
        self.docker
            .resize_container_tty(
                &self.uuid,
                ResizeContainerTtyOptions {
                    width,
                    height,
                },
            )
            .await?;

        Ok(())
    }

    async fn destroy(&self) -> RoostResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(&self.uuid, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn events(&self) -> &EnvironmentEvents {
        &self.events
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: Console streaming
//--------------------------------------------------------------------------------------------------

impl DockerEnvironment {
    /// Reads the attached output stream, reassembles lines and fans them out
    /// on the console channel. Lagging subscribers are the channel's problem;
    /// this task never blocks on them.
    fn spawn_output_reader(
        &self,
        mut output: impl futures::Stream<Item = Result<LogOutput, bollard::errors::Error>>
            + Send
            + Unpin
            + 'static,
    ) {
        let console = self.console.clone();
        let uuid = self.uuid.clone();
        let attached = AttachedGuard {
            uuid: self.uuid.clone(),
            flag: Arc::clone(&self.attached),
        };

        tokio::spawn(async move {
            let _attached = attached;
            let mut pending = String::new();

            while let Some(chunk) = output.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::debug!(server = %uuid, "console stream error: {}", err);
                        break;
                    }
                };

                pending.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                while let Some(position) = pending.find('\n') {
                    let line: String = pending.drain(..=position).collect();
                    let _ = console.send(line.trim_end_matches(['\n', '\r']).to_string());
                }
            }

            if !pending.is_empty() {
                let _ = console.send(pending);
            }
        });
    }
}

/// Clears the attach flag when the output reader ends so the next start can
/// re-attach.
struct AttachedGuard {
    uuid: String,
    flag: Arc<std::sync::atomic::AtomicBool>,
}

impl Drop for AttachedGuard {
    fn drop(&mut self) {
        self.flag.store(false, std::sync::atomic::Ordering::Release);
        tracing::debug!(server = %self.uuid, "console stream closed");
    }
}

//--------------------------------------------------------------------------------------------------
// Types: Factory
//--------------------------------------------------------------------------------------------------

/// Builds Docker environments around the process-wide client.
pub struct DockerEnvironmentFactory {
    docker: Arc<Docker>,
}

impl DockerEnvironmentFactory {
    /// Wraps the shared Docker client.
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }
}

impl crate::environment::EnvironmentFactory for DockerEnvironmentFactory {
    fn create(
        &self,
        uuid: uuid::Uuid,
        configuration: Arc<RwLock<ServerConfiguration>>,
        node_config: ConfigHandle,
        data_dir: std::path::PathBuf,
        console: broadcast::Sender<String>,
    ) -> Arc<dyn crate::environment::Environment> {
        DockerEnvironment::new(
            Arc::clone(&self.docker),
            uuid,
            configuration,
            node_config,
            data_dir,
            console,
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn throttle_devices(
    limits: &[crate::server::configuration::DeviceLimit],
    rate: impl Fn(&crate::server::configuration::DeviceLimit) -> u64,
) -> Option<Vec<ThrottleDevice>> {
    let devices: Vec<ThrottleDevice> = limits
        .iter()
        .filter(|limit| rate(limit) > 0)
        .map(|limit| ThrottleDevice {
            path: Some(limit.device.clone()),
            rate: Some(rate(limit) as i64),
        })
        .collect();

    (!devices.is_empty()).then_some(devices)
}
