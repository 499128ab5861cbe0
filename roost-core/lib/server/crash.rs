//! Crash detection and the auto-restart policy.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{RoostError, RoostResult};

use super::{PowerAction, Server, ServerState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Tracks the time of the most recent crash for one server.
pub struct CrashHandler {
    last_crash: Mutex<Option<Instant>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CrashHandler {
    /// Creates a handler with no recorded crash.
    pub fn new() -> Self {
        Self {
            last_crash: Mutex::new(None),
        }
    }

    /// The time of the last crash, if one was recorded.
    pub fn last_crash_time(&self) -> Option<Instant> {
        *self.last_crash.lock().expect("crash lock poisoned")
    }

    /// Records the current time as the last crash.
    pub fn set_last_crash(&self) {
        *self.last_crash.lock().expect("crash lock poisoned") = Some(Instant::now());
    }
}

impl Default for CrashHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Decides whether an unexpected exit should auto-restart the server.
    ///
    /// Called when a crash is already suspected; the exit state and the
    /// crash-detection configuration decide whether a restart is issued. At
    /// most one crash-triggered restart happens per cooldown window, the
    /// second attempt fails with `crash_too_frequent`.
    pub async fn handle_server_crash(&self) -> RoostResult<()> {
        // Nothing to recover unless the process actually fell offline.
        if self.state.current() != ServerState::Offline {
            return Ok(());
        }

        let node = self.node_config.snapshot();
        let detection = node.get_system().get_crash_detection();
        let enabled =
            *detection.get_enabled() && self.configuration.read().await.crash_detection_enabled;

        if !enabled {
            tracing::debug!(
                server = %self.uuid,
                "crash handler triggered but detection is disabled"
            );
            self.publish_daemon_message(
                "Aborting automatic restart, crash detection is disabled for this instance.",
            );
            return Ok(());
        }

        let exit = self.environment.exit_state().await?;

        if exit.exit_code == 0 && !exit.oom_killed && !*detection.get_detect_clean_exit_as_crash() {
            tracing::debug!(
                server = %self.uuid,
                "process exited cleanly, not detecting this as a crash"
            );
            return Ok(());
        }

        self.publish_daemon_message(
            "---------- Detected server process in a crashed state! ----------",
        );
        self.publish_daemon_message(format!("Exit code: {}", exit.exit_code));
        self.publish_daemon_message(format!("Out of memory: {}", exit.oom_killed));

        let timeout = *detection.get_timeout();
        if timeout != 0 {
            if let Some(last) = self.crasher.last_crash_time() {
                if last.elapsed() < Duration::from_secs(timeout) {
                    self.publish_daemon_message(format!(
                        "Aborting automatic restart, last crash occurred within the last {} seconds.",
                        timeout
                    ));
                    return Err(RoostError::CrashTooFrequent);
                }
            }
        }

        self.crasher.set_last_crash();

        self.handle_power_action(PowerAction::Start).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use uuid::Uuid;

    use super::super::test_support::{
        test_server, test_server_configuration, MockEnvironment, MockEnvironmentFactory,
    };
    use super::super::{Server, ServerState};
    use crate::{config::ConfigHandle, ErrorKind};

    #[tokio::test]
    async fn test_two_crashes_within_cooldown_restart_once() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());
        environment.set_exit(137, false);

        server.handle_server_crash().await.unwrap();
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 1);

        // Second crash lands straight back in offline.
        server.state.set(ServerState::Offline);
        let err = server.handle_server_crash().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CrashTooFrequent);
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());
        environment.set_exit(0, false);

        server.handle_server_crash().await.unwrap();
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oom_kill_counts_as_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());
        environment.set_exit(0, true);

        server.handle_server_crash().await.unwrap();
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nothing_happens_unless_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (server, environment) = test_server(dir.path());
        environment.set_exit(137, false);

        server.state.set(ServerState::Running);
        server.handle_server_crash().await.unwrap();
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_detection_announces_and_stops() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = format!(
            "system:\n  root_directory: {root}/state\n  data: {root}/volumes\n  crash_detection:\n    enabled: false\n",
            root = dir.path().display()
        );
        let config = ConfigHandle::new(serde_yaml::from_str(&yaml).unwrap());

        let environment = MockEnvironment::new();
        environment.set_exit(137, false);
        let factory = MockEnvironmentFactory {
            environment: environment.clone(),
        };
        let server =
            Server::new(test_server_configuration(Uuid::new_v4()), config, &factory).unwrap();

        let (_backlog, mut console) = server.subscribe_console();

        server.handle_server_crash().await.unwrap();
        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 0);

        let line = console.recv().await.unwrap();
        assert!(line.contains("crash detection is disabled"));
    }

    #[tokio::test]
    async fn test_zero_timeout_always_restarts() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = format!(
            "system:\n  root_directory: {root}/state\n  data: {root}/volumes\n  crash_detection:\n    enabled: true\n    timeout: 0\n",
            root = dir.path().display()
        );
        let config = ConfigHandle::new(serde_yaml::from_str(&yaml).unwrap());

        let environment = MockEnvironment::new();
        environment.set_exit(1, false);
        let factory = MockEnvironmentFactory {
            environment: environment.clone(),
        };
        let server =
            Server::new(test_server_configuration(Uuid::new_v4()), config, &factory).unwrap();

        server.handle_server_crash().await.unwrap();
        server.state.set(ServerState::Offline);
        server.handle_server_crash().await.unwrap();

        assert_eq!(environment.start_calls.load(Ordering::SeqCst), 2);
    }
}
