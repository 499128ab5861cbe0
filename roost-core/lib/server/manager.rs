//! The server index for one node.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::ConfigHandle, environment::EnvironmentFactory, remote::PanelClient, RoostError,
    RoostResult,
};

use super::{configuration::ServerConfiguration, PowerAction, Server, ServerState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Indexes every server on this node by uuid and owns creation and deletion.
pub struct Manager {
    servers: RwLock<HashMap<Uuid, Arc<Server>>>,
    config: ConfigHandle,
    factory: Arc<dyn EnvironmentFactory>,
    panel: Option<Arc<PanelClient>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Manager {
    /// Creates an empty manager.
    pub fn new(
        config: ConfigHandle,
        factory: Arc<dyn EnvironmentFactory>,
        panel: Option<Arc<PanelClient>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            servers: RwLock::new(HashMap::new()),
            config,
            factory,
            panel,
        })
    }

    /// Looks up a server by uuid.
    pub async fn get(&self, uuid: &Uuid) -> Option<Arc<Server>> {
        self.servers.read().await.get(uuid).cloned()
    }

    /// Every server currently indexed.
    pub async fn all(&self) -> Vec<Arc<Server>> {
        self.servers.read().await.values().cloned().collect()
    }

    /// Number of servers currently indexed.
    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    /// True when no servers are indexed.
    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    /// Adds a server to the index, replacing any previous entry.
    pub async fn add(&self, server: Arc<Server>) {
        self.servers.write().await.insert(server.uuid(), server);
    }

    /// Removes a server from the index.
    pub async fn remove(&self, uuid: &Uuid) {
        self.servers.write().await.remove(uuid);
    }

    /// Constructs servers from the on-disk configuration documents and
    /// reconciles each against the container runtime: the container is
    /// ensured to exist, event streams are attached and the initial state is
    /// synced from the runtime. A server that fails to reconcile is logged
    /// and kept offline rather than aborting the boot.
    pub async fn init(self: &Arc<Self>) -> RoostResult<usize> {
        let dir = self.config.snapshot().server_configuration_dir();
        std::fs::create_dir_all(&dir)?;

        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| ext == "yml" || ext == "yaml");
            if !is_yaml {
                continue;
            }

            let configuration = match ServerConfiguration::from_disk(&path) {
                Ok(configuration) => configuration,
                Err(err) => {
                    tracing::error!(
                        "skipping malformed server configuration {}: {}",
                        path.display(),
                        err
                    );
                    continue;
                }
            };

            let uuid = configuration.uuid;
            let server = Server::new(configuration, self.config.clone(), self.factory.as_ref())?;

            if let Err(err) = server.reconcile_with_runtime().await {
                tracing::error!(server = %uuid, "failed to reconcile with the runtime: {}", err);
            }

            self.add(server).await;
            loaded += 1;
        }

        tracing::info!("initialized {} servers from disk", loaded);
        Ok(loaded)
    }

    /// Replaces the on-disk configuration documents with a fresh panel sync,
    /// updating live servers in place. New documents only land on disk; the
    /// servers are constructed by the following [`Manager::init`].
    pub async fn sync_from_panel(&self) -> RoostResult<usize> {
        let panel = self
            .panel
            .as_ref()
            .ok_or_else(|| RoostError::Configuration("no panel client configured".to_string()))?;

        let configurations = panel.servers().await?;
        let dir = self.config.snapshot().server_configuration_dir();
        std::fs::create_dir_all(&dir)?;

        let count = configurations.len();
        for configuration in configurations {
            let path = dir.join(format!("{}.yml", configuration.uuid));

            if let Some(server) = self.get(&configuration.uuid).await {
                server.update_configuration(configuration).await?;
            } else {
                configuration.to_disk(&path)?;
            }
        }

        Ok(count)
    }

    /// Creates a server from a panel-provided configuration document.
    ///
    /// The document is persisted before the server becomes visible. The
    /// install flow runs in the background: the server sits in `installing`,
    /// falls to `offline` (or `install_failed`) and is optionally started.
    pub async fn create_server(
        self: &Arc<Self>,
        configuration: ServerConfiguration,
        start_on_completion: bool,
    ) -> RoostResult<Arc<Server>> {
        let uuid = configuration.uuid;
        if self.get(&uuid).await.is_some() {
            return Err(RoostError::InvalidArgument(format!(
                "server {} already exists on this node",
                uuid
            )));
        }

        let path = self
            .config
            .snapshot()
            .server_configuration_dir()
            .join(format!("{}.yml", uuid));
        configuration.to_disk(&path)?;

        let server = Server::new(configuration, self.config.clone(), self.factory.as_ref())?;
        self.add(Arc::clone(&server)).await;

        server.set_state(ServerState::Installing);

        let manager = Arc::clone(self);
        let installing = Arc::clone(&server);
        tokio::spawn(async move {
            manager.install_server(installing, start_on_completion).await;
        });

        Ok(server)
    }

    /// Deletes a server: container teardown, data directory removal, config
    /// document removal, then index removal.
    pub async fn delete_server(&self, uuid: &Uuid) -> RoostResult<()> {
        let server = self
            .get(uuid)
            .await
            .ok_or_else(|| RoostError::NotFound(format!("server {}", uuid)))?;

        server.environment().destroy().await?;

        let root = server.filesystem().root().to_path_buf();
        if let Err(err) = tokio::fs::remove_dir_all(&root).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        match std::fs::remove_file(server.configuration_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        self.remove(uuid).await;
        tracing::info!(server = %uuid, "deleted server from this node");

        Ok(())
    }

    /// Writes a daemon message to every server console.
    pub async fn broadcast_console(&self, message: &str) {
        for server in self.all().await {
            server.publish_daemon_message(message);
        }
    }

    //----------------------------------------------------------------------------------------------
    // Helpers
    //----------------------------------------------------------------------------------------------

    async fn install_server(&self, server: Arc<Server>, start_on_completion: bool) {
        let uuid = server.uuid();
        server.publish_daemon_message("Beginning installation process for this server...");

        let result = server.environment().create().await;
        let successful = result.is_ok();

        match result {
            Ok(()) => {
                server.set_state(ServerState::Offline);
                server.publish_daemon_message("Installation completed.");
            }
            Err(err) => {
                tracing::error!(server = %uuid, "server installation failed: {}", err);
                server.set_state(ServerState::InstallFailed);
                server.publish_daemon_message("Installation failed, contact an administrator.");
            }
        }

        if let Some(panel) = &self.panel {
            if let Err(err) = panel.report_install_status(&uuid, successful, false).await {
                tracing::warn!(server = %uuid, "failed to report install status: {}", err);
            }
        }

        if successful && start_on_completion {
            if let Err(err) = server.handle_power_action(PowerAction::Start).await {
                tracing::warn!(server = %uuid, "failed to start after install: {}", err);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::super::test_support::{
        test_config, test_server_configuration, MockEnvironment, MockEnvironmentFactory,
    };
    use super::*;

    fn test_manager(root: &std::path::Path) -> (Arc<Manager>, Arc<MockEnvironment>) {
        let environment = MockEnvironment::new();
        let factory = Arc::new(MockEnvironmentFactory {
            environment: environment.clone(),
        });

        (Manager::new(test_config(root), factory, None), environment)
    }

    #[tokio::test]
    async fn test_create_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _environment) = test_manager(dir.path());

        let uuid = Uuid::new_v4();
        let server = manager
            .create_server(test_server_configuration(uuid), false)
            .await
            .unwrap();

        assert_eq!(server.uuid(), uuid);
        assert!(manager.get(&uuid).await.is_some());
        assert!(server.configuration_path().exists());

        // Creating the same uuid twice is refused.
        assert!(manager
            .create_server(test_server_configuration(uuid), false)
            .await
            .is_err());

        manager.delete_server(&uuid).await.unwrap();
        assert!(manager.get(&uuid).await.is_none());
        assert!(!server.configuration_path().exists());
    }

    #[tokio::test]
    async fn test_install_flow_lands_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _environment) = test_manager(dir.path());

        let server = manager
            .create_server(test_server_configuration(Uuid::new_v4()), false)
            .await
            .unwrap();

        server
            .wait_for_state(ServerState::Offline, std::time::Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_loads_documents_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _environment) = test_manager(dir.path());

        let config_dir = manager.config.snapshot().server_configuration_dir();
        std::fs::create_dir_all(&config_dir).unwrap();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        for uuid in [first, second] {
            test_server_configuration(uuid)
                .to_disk(config_dir.join(format!("{}.yml", uuid)))
                .unwrap();
        }
        std::fs::write(config_dir.join("notes.txt"), "ignored").unwrap();

        let loaded = manager.init().await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(manager.len().await, 2);

        let server = manager.get(&first).await.unwrap();
        assert_eq!(server.state(), ServerState::Offline);
    }
}
