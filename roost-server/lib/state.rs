//! Application state shared by every request handler.

use std::sync::Arc;

use getset::Getters;
use roost_core::{config::ConfigHandle, remote::PanelClient, server::Manager};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// State handed to the router; cheap to clone per request.
#[derive(Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AppState {
    /// Handle to the current node configuration snapshot.
    config: ConfigHandle,

    /// The server index for this node.
    manager: Arc<Manager>,

    /// Panel client for reporting backup outcomes, when configured.
    panel: Option<Arc<PanelClient>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AppState {
    /// Creates a new application state instance.
    pub fn new(
        config: ConfigHandle,
        manager: Arc<Manager>,
        panel: Option<Arc<PanelClient>>,
    ) -> Self {
        Self {
            config,
            manager,
            panel,
        }
    }
}
