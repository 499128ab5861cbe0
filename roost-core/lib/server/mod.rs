//! The server object and its lifecycle plumbing.
//!
//! A [`Server`] aggregates everything one managed game server needs: the
//! panel-synced configuration document, the state publisher, the console
//! fan-out, the sandboxed filesystem, the runtime environment, the
//! power-action semaphore and the crash handler.

pub mod configuration;

mod console;
mod crash;
mod manager;
mod power;
mod state;

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::{broadcast, RwLock, Semaphore};
use uuid::Uuid;

use crate::{
    config::ConfigHandle,
    environment::{Environment, EnvironmentFactory, RuntimeState},
    filesystem::Filesystem,
    RoostResult,
};

use configuration::ServerConfiguration;
use console::ConsoleBuffer;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use crash::*;
pub use manager::*;
pub use power::*;
pub use state::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Per-subscriber buffer of the console broadcast channel. A subscriber that
/// falls further behind than this is disconnected rather than ever blocking
/// the producer.
const CONSOLE_CHANNEL_SIZE: usize = 256;

/// Prefix attached to messages the daemon itself writes to a server console.
const DAEMON_MESSAGE_PREFIX: &str = "[roost daemon]:";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One managed game server.
pub struct Server {
    uuid: Uuid,
    configuration: Arc<RwLock<ServerConfiguration>>,
    node_config: ConfigHandle,
    filesystem: Arc<Filesystem>,
    environment: Arc<dyn Environment>,
    state: StatePublisher,
    console: broadcast::Sender<String>,
    console_buffer: ConsoleBuffer,
    power_semaphore: Semaphore,
    crasher: CrashHandler,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Server {
    /// Builds a server from its configuration document and spawns the event
    /// monitor that drives the state machine.
    pub fn new(
        configuration: ServerConfiguration,
        node_config: ConfigHandle,
        factory: &dyn EnvironmentFactory,
    ) -> RoostResult<Arc<Self>> {
        let uuid = configuration.uuid;
        let node = node_config.snapshot();

        let filesystem = Arc::new(Filesystem::new(
            node.server_data_dir(&uuid),
            configuration.build.disk_bytes,
            &configuration.file_denylist,
            Duration::from_secs(*node.get_system().get_disk_check_interval()),
        )?);
        filesystem
            .set_legacy_filename_fallback(*node.get_system().get_legacy_filename_fallback());

        let (console, _) = broadcast::channel(CONSOLE_CHANNEL_SIZE);
        let initial_state = if configuration.suspended {
            ServerState::Suspended
        } else {
            ServerState::Offline
        };

        let configuration = Arc::new(RwLock::new(configuration));
        let environment = factory.create(
            uuid,
            Arc::clone(&configuration),
            node_config.clone(),
            filesystem.root().to_path_buf(),
            console.clone(),
        );

        let server = Arc::new(Self {
            uuid,
            configuration,
            node_config: node_config.clone(),
            filesystem,
            environment,
            state: StatePublisher::new(initial_state),
            console,
            console_buffer: ConsoleBuffer::new(*node.get_system().get_websocket_log_count()),
            power_semaphore: Semaphore::new(1),
            crasher: CrashHandler::new(),
        });

        server.spawn_monitor();
        Ok(server)
    }

    /// The server's panel-assigned identifier.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.state.current()
    }

    /// Subscribes to lifecycle state transitions.
    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Waits until the server reaches the given state.
    pub async fn wait_for_state(&self, state: ServerState, timeout: Duration) -> RoostResult<()> {
        self.state.wait_for(state, timeout).await
    }

    /// Publishes a state transition. Crate-internal; callers outside the
    /// engine drive state through power actions and runtime events only.
    pub(crate) fn set_state(&self, state: ServerState) -> ServerState {
        self.state.set(state)
    }

    /// The sandboxed filesystem view.
    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.filesystem
    }

    /// The runtime environment adapter.
    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.environment
    }

    /// A clone of the current configuration document.
    pub async fn configuration(&self) -> ServerConfiguration {
        self.configuration.read().await.clone()
    }

    /// Subscribes to the console, returning replayable backlog lines first.
    pub fn subscribe_console(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let backlog = self.console_buffer.recent(usize::MAX);
        (backlog, self.console.subscribe())
    }

    /// Writes a daemon-attributed message to the server console.
    pub fn publish_daemon_message(&self, message: impl AsRef<str>) {
        let _ = self
            .console
            .send(format!("{} {}", DAEMON_MESSAGE_PREFIX, message.as_ref()));
    }

    /// Forwards a console command to the server process.
    pub async fn send_command(&self, command: &str) -> RoostResult<()> {
        self.environment.send_command(command).await
    }

    /// Replaces the configuration document with a newer panel sync, updating
    /// the quota, the denylist and the persisted copy.
    pub async fn update_configuration(&self, update: ServerConfiguration) -> RoostResult<()> {
        {
            let mut configuration = self.configuration.write().await;

            self.filesystem.set_disk_limit(update.build.disk_bytes);
            self.filesystem.update_denylist(&update.file_denylist)?;

            update.to_disk(self.configuration_path())?;
            *configuration = update;
        }

        let suspended = self.configuration.read().await.suspended;
        match (suspended, self.state.current()) {
            (true, ServerState::Offline) => {
                self.state.set(ServerState::Suspended);
            }
            (false, ServerState::Suspended) => {
                self.state.set(ServerState::Offline);
            }
            _ => {}
        }

        Ok(())
    }

    /// Ensures the container exists, attaches the event streams and syncs the
    /// initial state from the runtime. Called once per server during boot.
    pub async fn reconcile_with_runtime(&self) -> RoostResult<()> {
        self.environment.create().await?;

        if self.environment.is_running().await? {
            self.environment.attach().await?;
            self.state.set(ServerState::Running);
            self.environment
                .events()
                .publish_state(RuntimeState::Running);
        } else if self.configuration.read().await.suspended {
            self.state.set(ServerState::Suspended);
        } else {
            self.state.set(ServerState::Offline);
        }

        Ok(())
    }

    /// Location of the persisted configuration document.
    pub fn configuration_path(&self) -> PathBuf {
        self.node_config
            .snapshot()
            .server_configuration_dir()
            .join(format!("{}.yml", self.uuid))
    }

    //----------------------------------------------------------------------------------------------
    // Helpers
    //----------------------------------------------------------------------------------------------

    /// Consumes console lines and runtime state events, drives the state
    /// machine and hands unexpected exits to the crash handler.
    fn spawn_monitor(self: &Arc<Self>) {
        let server = Arc::clone(self);

        tokio::spawn(async move {
            let mut console = server.console.subscribe();
            let mut runtime = server.environment.events().subscribe_state();

            loop {
                tokio::select! {
                    line = console.recv() => match line {
                        Ok(line) => {
                            server.console_buffer.push(line);
                            // First output while starting means the process is up.
                            if server.state.current() == ServerState::Starting {
                                server.state.set(ServerState::Running);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = runtime.recv() => match event {
                        Ok(RuntimeState::Running) => {
                            if matches!(
                                server.state.current(),
                                ServerState::Starting | ServerState::Offline
                            ) {
                                server.state.set(ServerState::Running);
                            }
                        }
                        Ok(RuntimeState::Offline) => {
                            let previous = server.state.set(ServerState::Offline);
                            if matches!(previous, ServerState::Starting | ServerState::Running) {
                                let server = Arc::clone(&server);
                                tokio::spawn(async move {
                                    if let Err(err) = server.handle_server_crash().await {
                                        tracing::info!(
                                            server = %server.uuid,
                                            "crash handling ended: {}",
                                            err
                                        );
                                    }
                                });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Test Support
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{broadcast, RwLock};
    use uuid::Uuid;

    use crate::{
        config::{Config, ConfigHandle},
        environment::{
            Environment, EnvironmentEvents, EnvironmentFactory, ExitState, RuntimeState,
        },
        server::configuration::ServerConfiguration,
        RoostResult,
    };

    /// An in-memory environment for lifecycle tests.
    pub(crate) struct MockEnvironment {
        pub events: EnvironmentEvents,
        pub running: AtomicBool,
        pub exit: Mutex<ExitState>,
        pub start_calls: AtomicUsize,
        pub terminate_calls: AtomicUsize,
        pub start_delay: Mutex<Option<Duration>>,
    }

    impl MockEnvironment {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                events: EnvironmentEvents::new(),
                running: AtomicBool::new(false),
                exit: Mutex::new(ExitState {
                    exit_code: 0,
                    oom_killed: false,
                }),
                start_calls: AtomicUsize::new(0),
                terminate_calls: AtomicUsize::new(0),
                start_delay: Mutex::new(None),
            })
        }

        pub fn set_exit(&self, exit_code: i64, oom_killed: bool) {
            *self.exit.lock().unwrap() = ExitState {
                exit_code,
                oom_killed,
            };
        }
    }

    #[async_trait]
    impl Environment for MockEnvironment {
        async fn exists(&self) -> RoostResult<bool> {
            Ok(true)
        }

        async fn create(&self) -> RoostResult<()> {
            Ok(())
        }

        async fn attach(&self) -> RoostResult<()> {
            Ok(())
        }

        async fn start(&self) -> RoostResult<()> {
            let delay = *self.start_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.start_calls.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> RoostResult<()> {
            self.running.store(false, Ordering::SeqCst);
            self.events.publish_state(RuntimeState::Offline);
            Ok(())
        }

        async fn terminate(&self, _signal: &str) -> RoostResult<()> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            self.events.publish_state(RuntimeState::Offline);
            Ok(())
        }

        async fn wait_for_stop(
            &self,
            _timeout: Duration,
            _terminate_on_timeout: bool,
        ) -> RoostResult<()> {
            Ok(())
        }

        async fn exit_state(&self) -> RoostResult<ExitState> {
            Ok(*self.exit.lock().unwrap())
        }

        async fn is_running(&self) -> RoostResult<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }

        async fn read_log(&self, _lines: usize) -> RoostResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn send_command(&self, _command: &str) -> RoostResult<()> {
            Ok(())
        }

        async fn resize(&self, _width: u16, _height: u16) -> RoostResult<()> {
            Ok(())
        }

        async fn destroy(&self) -> RoostResult<()> {
            Ok(())
        }

        fn events(&self) -> &EnvironmentEvents {
            &self.events
        }
    }

    /// Hands every server the same pre-built mock environment.
    pub(crate) struct MockEnvironmentFactory {
        pub environment: Arc<MockEnvironment>,
    }

    impl EnvironmentFactory for MockEnvironmentFactory {
        fn create(
            &self,
            _uuid: Uuid,
            _configuration: Arc<RwLock<ServerConfiguration>>,
            _node_config: ConfigHandle,
            _data_dir: std::path::PathBuf,
            _console: broadcast::Sender<String>,
        ) -> Arc<dyn Environment> {
            self.environment.clone()
        }
    }

    /// A node configuration pointing every path at a temp directory.
    pub(crate) fn test_config(root: &std::path::Path) -> ConfigHandle {
        let yaml = format!(
            "system:\n  root_directory: {root}/state\n  data: {root}/volumes\n  archive_directory: {root}/archives\n  backup_directory: {root}/backups\n  crash_detection:\n    enabled: true\n    detect_clean_exit_as_crash: false\n    timeout: 60\n",
            root = root.display()
        );

        ConfigHandle::new(serde_yaml::from_str::<Config>(&yaml).unwrap())
    }

    /// A minimal configuration document for one test server.
    pub(crate) fn test_server_configuration(uuid: Uuid) -> ServerConfiguration {
        serde_yaml::from_str(&format!(
            "uuid: {uuid}\nimage: ghcr.io/example/game:latest\ninvocation: ./start.sh\n"
        ))
        .unwrap()
    }

    /// Builds a server wired to a mock environment.
    pub(crate) fn test_server(
        root: &std::path::Path,
    ) -> (Arc<super::Server>, Arc<MockEnvironment>) {
        let environment = MockEnvironment::new();
        let factory = MockEnvironmentFactory {
            environment: environment.clone(),
        };

        let uuid = Uuid::new_v4();
        let server = super::Server::new(
            test_server_configuration(uuid),
            test_config(root),
            &factory,
        )
        .unwrap();

        (server, environment)
    }
}
