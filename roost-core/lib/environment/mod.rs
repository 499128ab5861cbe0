//! Uniform adapter over the container runtime.
//!
//! The [`Environment`] trait is the seam between the lifecycle engine and the
//! runtime: every call is safe to make concurrently and lifecycle ordering is
//! enforced by the power controller, never here. `start` on a running
//! container and `stop` on an offline container are no-ops by contract.

pub mod docker;

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::{
    config::ConfigHandle, server::configuration::ServerConfiguration, RoostResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Signal used when escalating a stop or handling a kill action.
pub const SIGKILL: &str = "SIGKILL";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Description of a container's most recent exit.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExitState {
    /// Process exit code reported by the runtime.
    pub exit_code: i64,

    /// True when the kernel OOM killer terminated the process.
    pub oom_killed: bool,
}

/// Runtime-observed process states, published on the `state` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    /// The container process is running.
    Running,

    /// The container process has exited.
    Offline,
}

/// A point-in-time resource sample, published on the `resources` topic.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceUsage {
    /// Memory in use, bytes.
    pub memory_bytes: u64,

    /// Memory limit visible to the container, bytes.
    pub memory_limit_bytes: u64,

    /// Absolute CPU usage where 100 is one full core.
    pub cpu_absolute: f64,

    /// Bytes received across all container interfaces.
    pub network_rx_bytes: u64,

    /// Bytes sent across all container interfaces.
    pub network_tx_bytes: u64,
}

/// Progress of an image pull, published on the `docker_image_pull_status`
/// topic.
#[derive(Debug, Clone, Serialize)]
pub struct ImagePullStatus {
    /// Pull phase reported by the registry.
    pub status: String,

    /// Layer progress detail, possibly empty.
    pub progress: String,
}

/// The typed topic publishers exposed by an environment.
///
/// One consumer inside the adapter demultiplexes raw runtime events onto
/// these topics; everything else subscribes.
pub struct EnvironmentEvents {
    state: broadcast::Sender<RuntimeState>,
    resources: broadcast::Sender<ResourceUsage>,
    image_pull: broadcast::Sender<ImagePullStatus>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvironmentEvents {
    /// Creates the topic publishers with bounded per-subscriber buffers.
    pub fn new() -> Self {
        let (state, _) = broadcast::channel(64);
        let (resources, _) = broadcast::channel(64);
        let (image_pull, _) = broadcast::channel(32);

        Self {
            state,
            resources,
            image_pull,
        }
    }

    /// Subscribes to runtime state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Subscribes to resource samples.
    pub fn subscribe_resources(&self) -> broadcast::Receiver<ResourceUsage> {
        self.resources.subscribe()
    }

    /// Subscribes to image pull progress.
    pub fn subscribe_image_pull(&self) -> broadcast::Receiver<ImagePullStatus> {
        self.image_pull.subscribe()
    }

    /// Publishes a runtime state transition. Lagging subscribers are dropped
    /// by the channel, never blocking the publisher.
    pub fn publish_state(&self, state: RuntimeState) {
        let _ = self.state.send(state);
    }

    /// Publishes a resource sample.
    pub fn publish_resources(&self, usage: ResourceUsage) {
        let _ = self.resources.send(usage);
    }

    /// Publishes image pull progress.
    pub fn publish_image_pull(&self, status: ImagePullStatus) {
        let _ = self.image_pull.send(status);
    }
}

impl Default for EnvironmentEvents {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Uniform container lifecycle interface.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Returns true when a container exists for the server.
    async fn exists(&self) -> RoostResult<bool>;

    /// Ensures a container named after the server uuid exists. Idempotent.
    async fn create(&self) -> RoostResult<()>;

    /// Attaches the console streams. Idempotent while attached.
    async fn attach(&self) -> RoostResult<()>;

    /// Starts the container. A running container is a no-op success.
    async fn start(&self) -> RoostResult<()>;

    /// Issues the configured stop directive, waits for the configured stop
    /// timeout and escalates to a force kill when it elapses. An offline
    /// container is a no-op.
    async fn stop(&self) -> RoostResult<()>;

    /// Delivers a signal without waiting.
    async fn terminate(&self, signal: &str) -> RoostResult<()>;

    /// Blocks until the container exits or `timeout` passes. When the
    /// deadline passes and `terminate_on_timeout` is set, a SIGKILL is sent
    /// and the wait continues without a further deadline.
    async fn wait_for_stop(&self, timeout: Duration, terminate_on_timeout: bool)
        -> RoostResult<()>;

    /// Describes the last container exit.
    async fn exit_state(&self) -> RoostResult<ExitState>;

    /// Returns true while the container process is running.
    async fn is_running(&self) -> RoostResult<bool>;

    /// Returns up to `lines` lines from the end of the container log.
    async fn read_log(&self, lines: usize) -> RoostResult<Vec<String>>;

    /// Writes a command to the container stdin.
    async fn send_command(&self, command: &str) -> RoostResult<()>;

    /// Resizes the container pseudo-terminal.
    async fn resize(&self, width: u16, height: u16) -> RoostResult<()>;

    /// Removes the container and its anonymous volumes.
    async fn destroy(&self) -> RoostResult<()>;

    /// The typed event topics for this environment.
    fn events(&self) -> &EnvironmentEvents;
}

/// Builds environments for new server objects.
///
/// The seam exists so the lifecycle engine can be exercised against an
/// in-memory runtime in tests.
pub trait EnvironmentFactory: Send + Sync {
    /// Creates the environment for one server.
    fn create(
        &self,
        uuid: Uuid,
        configuration: Arc<RwLock<ServerConfiguration>>,
        node_config: ConfigHandle,
        data_dir: PathBuf,
        console: broadcast::Sender<String>,
    ) -> Arc<dyn Environment>;
}
