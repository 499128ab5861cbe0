//! Power-action serialization and semantics.
//!
//! A per-server semaphore of capacity one guards the whole action, so at most
//! one of start/stop/restart runs at a time. A kill must always be runnable
//! and therefore bypasses the semaphore entirely.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{environment::SIGKILL, RoostError, RoostResult};

use super::{Server, ServerState};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long start/stop/restart wait for the action semaphore before the
/// request fails with a busy error.
pub const DEFAULT_POWER_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a restart waits for the offline transition after the stop wait
/// has already completed inside the environment.
const OFFLINE_GRACE: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Actions a caller can request against a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    /// Bring an offline server up.
    Start,

    /// Ask the process to stop via the configured stop directive.
    Stop,

    /// Stop, wait for offline, then start again.
    Restart,

    /// SIGKILL the process without waiting.
    Kill,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PowerAction {
    /// The stable wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Restart => "restart",
            PowerAction::Kill => "kill",
        }
    }
}

impl Server {
    /// Executes a power action with the default semaphore wait.
    pub async fn handle_power_action(&self, action: PowerAction) -> RoostResult<()> {
        self.handle_power_action_with_wait(action, DEFAULT_POWER_ACQUIRE_TIMEOUT)
            .await
    }

    /// Executes a power action, waiting up to `wait` for the per-server
    /// action semaphore. Contention past the wait fails with a busy error;
    /// a kill never touches the semaphore.
    pub async fn handle_power_action_with_wait(
        &self,
        action: PowerAction,
        wait: Duration,
    ) -> RoostResult<()> {
        tracing::debug!(server = %self.uuid, action = action.as_str(), "processing power action");

        if action == PowerAction::Kill {
            return self.power_kill().await;
        }

        let _permit = match tokio::time::timeout(wait, self.power_semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RoostError::Cancelled),
            Err(_) => return Err(RoostError::PowerLocked),
        };

        match action {
            PowerAction::Start => self.power_start().await,
            PowerAction::Stop => self.power_stop().await,
            PowerAction::Restart => self.power_restart().await,
            PowerAction::Kill => unreachable!("kill bypasses the semaphore"),
        }
    }

    //----------------------------------------------------------------------------------------------
    // Helpers
    //----------------------------------------------------------------------------------------------

    async fn power_start(&self) -> RoostResult<()> {
        if self.configuration.read().await.suspended {
            return Err(RoostError::Suspended);
        }

        let current = self.state.current();
        if current != ServerState::Offline {
            return Err(RoostError::InvalidPowerState {
                action: "start",
                state: current.as_str(),
            });
        }

        // A server already over its quota is refused before the runtime is
        // touched.
        if self.filesystem.disk_limit() > 0 {
            let usage = self.filesystem.disk_usage(false).await?;
            if usage > self.filesystem.disk_limit() {
                self.publish_daemon_message(
                    "Not enough disk space is available to start this server.",
                );
                return Err(RoostError::DiskSpace);
            }
        }

        self.state.set(ServerState::Starting);

        let bring_up = async {
            self.environment.create().await?;
            self.environment.attach().await?;
            self.environment.start().await
        };

        if let Err(err) = bring_up.await {
            // Roll back so the server does not wedge in starting.
            self.state.set(ServerState::Offline);
            return Err(err);
        }

        Ok(())
    }

    async fn power_stop(&self) -> RoostResult<()> {
        if self.state.current() == ServerState::Offline {
            return Ok(());
        }

        self.state.set(ServerState::Stopping);

        // The stop directive, the stop-timeout wait and the kill escalation
        // all happen inside the environment; the controller returns without
        // waiting. The state falls to offline on the exit event.
        let environment = Arc::clone(&self.environment);
        let uuid = self.uuid;
        tokio::spawn(async move {
            if let Err(err) = environment.stop().await {
                tracing::warn!(server = %uuid, "error while stopping server: {}", err);
            }
        });

        Ok(())
    }

    async fn power_restart(&self) -> RoostResult<()> {
        if self.state.current() != ServerState::Offline {
            self.state.set(ServerState::Stopping);
            self.environment.stop().await?;
            self.state
                .wait_for(ServerState::Offline, OFFLINE_GRACE)
                .await?;
        }

        self.power_start().await
    }

    async fn power_kill(&self) -> RoostResult<()> {
        self.environment.terminate(SIGKILL).await?;

        // The exit event normally flips the state; sync defensively in case
        // the container was already gone and no event will arrive.
        if !self.environment.is_running().await?
            && matches!(
                self.state.current(),
                ServerState::Starting | ServerState::Running | ServerState::Stopping
            )
        {
            self.state.set(ServerState::Offline);
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::super::test_support::test_server;
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_start_from_offline_transitions_to_starting() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());

        server.handle_power_action(PowerAction::Start).await.unwrap();

        assert_eq!(server.state(), ServerState::Starting);
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_refused_unless_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _environment) = test_server(dir.path());

        server.state.set(ServerState::Running);
        let err = server
            .handle_power_action(PowerAction::Start)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[tokio::test]
    async fn test_concurrent_action_returns_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());

        *environment.start_delay.lock().unwrap() = Some(Duration::from_millis(300));

        let racing = {
            let server = server.clone();
            tokio::spawn(async move { server.handle_power_action(PowerAction::Start).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = server
            .handle_power_action_with_wait(PowerAction::Restart, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        racing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_kill_bypasses_the_semaphore() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());

        *environment.start_delay.lock().unwrap() = Some(Duration::from_millis(300));

        let racing = {
            let server = server.clone();
            tokio::spawn(async move { server.handle_power_action(PowerAction::Start).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.handle_power_action(PowerAction::Kill).await.unwrap();
        assert_eq!(environment.terminate_calls.load(Ordering::SeqCst), 1);

        racing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_on_offline_server_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _environment) = test_server(dir.path());

        server.handle_power_action(PowerAction::Stop).await.unwrap();
        assert_eq!(server.state(), ServerState::Offline);
    }

    #[tokio::test]
    async fn test_stop_transitions_to_stopping_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _environment) = test_server(dir.path());

        server.state.set(ServerState::Running);
        server.handle_power_action(PowerAction::Stop).await.unwrap();

        // The exit event from the environment flips the state to offline.
        server
            .state
            .wait_for(ServerState::Offline, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_stops_then_starts() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());

        server.state.set(ServerState::Running);
        server
            .handle_power_action(PowerAction::Restart)
            .await
            .unwrap();

        assert_eq!(server.state(), ServerState::Starting);
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_suspended_server_refuses_start() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _environment) = test_server(dir.path());

        let mut configuration = server.configuration().await;
        configuration.suspended = true;
        server.update_configuration(configuration).await.unwrap();

        let err = server
            .handle_power_action(PowerAction::Start)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
