//! Server process states and the state publisher.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{RoostError, RoostResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lifecycle states a server can occupy.
///
/// A just-created server may only occupy `installing` or `offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// The install flow is preparing the server for first use.
    Installing,

    /// The install flow failed; the server cannot be started.
    InstallFailed,

    /// The panel suspended the server.
    Suspended,

    /// The container process is not running.
    Offline,

    /// A start was issued; waiting for the runtime to come up.
    Starting,

    /// The container process is running.
    Running,

    /// A stop directive was issued; waiting for the process to exit.
    Stopping,
}

/// Publishes state transitions to any number of subscribers.
///
/// Transitions are delivered in the order observed. A slow subscriber only
/// ever skips ahead to the latest state, it can never observe transitions out
/// of order or block the publisher.
pub struct StatePublisher {
    tx: watch::Sender<ServerState>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerState {
    /// The stable wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Installing => "installing",
            ServerState::InstallFailed => "install_failed",
            ServerState::Suspended => "suspended",
            ServerState::Offline => "offline",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        }
    }
}

impl StatePublisher {
    /// Creates a publisher in the given initial state.
    pub fn new(initial: ServerState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// The current state.
    pub fn current(&self) -> ServerState {
        *self.tx.borrow()
    }

    /// Publishes a new state, returning the previous one.
    pub fn set(&self, state: ServerState) -> ServerState {
        self.tx.send_replace(state)
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    /// Waits until the server reaches `target`, failing after `timeout`.
    pub async fn wait_for(&self, target: ServerState, timeout: Duration) -> RoostResult<()> {
        let mut rx = self.tx.subscribe();

        let result = match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RoostError::Cancelled),
            Err(_) => Err(RoostError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("server did not reach the {} state in time", target.as_str()),
            ))),
        };
        result
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(ServerState::InstallFailed.as_str(), "install_failed");
        assert_eq!(
            serde_json::to_string(&ServerState::Running).unwrap(),
            "\"running\""
        );
    }

    #[tokio::test]
    async fn test_set_returns_previous_state() {
        let publisher = StatePublisher::new(ServerState::Offline);
        assert_eq!(publisher.set(ServerState::Starting), ServerState::Offline);
        assert_eq!(publisher.current(), ServerState::Starting);
    }

    #[tokio::test]
    async fn test_wait_for_observes_transition() {
        let publisher = StatePublisher::new(ServerState::Running);

        let rx = publisher.subscribe();
        let wait = publisher.wait_for(ServerState::Offline, Duration::from_secs(1));

        publisher.set(ServerState::Offline);
        wait.await.unwrap();
        drop(rx);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let publisher = StatePublisher::new(ServerState::Running);
        let err = publisher
            .wait_for(ServerState::Offline, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }
}
