//! Runtime event consumption for the Docker environment.
//!
//! A single consumer per server demultiplexes the Docker event stream onto
//! the typed topics of [`EnvironmentEvents`]. A second task samples the stats
//! stream whenever the container is running and feeds the `resources` topic.

use std::{collections::HashMap, sync::Arc};

use bollard::{
    container::{Stats, StatsOptions},
    models::EventMessage,
    system::EventsOptions,
};
use futures::StreamExt;

use crate::environment::{Environment, ResourceUsage, RuntimeState};

use super::DockerEnvironment;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerEnvironment {
    /// Spawns the single consumer that turns raw Docker events into typed
    /// state topic messages.
    pub(super) fn spawn_event_loop(self: &Arc<Self>) {
        let environment = Arc::clone(self);

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            filters.insert("container".to_string(), vec![environment.uuid.clone()]);

            let options = EventsOptions::<String> {
                filters,
                ..Default::default()
            };

            let mut stream = environment.docker.events(Some(options));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => environment.handle_event(event),
                    Err(err) => {
                        tracing::warn!(
                            server = %environment.uuid,
                            "docker event stream error: {}",
                            err
                        );
                        break;
                    }
                }
            }

            tracing::debug!(server = %environment.uuid, "docker event stream ended");
        });
    }

    fn handle_event(&self, event: EventMessage) {
        let action = event.action.as_deref().unwrap_or("");
        tracing::trace!(server = %self.uuid, action = %action, "container event");

        match action {
            "start" => self.events.publish_state(RuntimeState::Running),
            "die" => self.events.publish_state(RuntimeState::Offline),
            "oom" => {
                let _ = self
                    .console
                    .send("container ran out of memory, the kernel OOM killer stepped in".to_string());
            }
            _ => {}
        }
    }

    /// Spawns the resource sampler. It follows the state topic: while the
    /// container is running the stats stream is consumed, otherwise the task
    /// parks on the next state transition.
    pub(super) fn spawn_stats_loop(self: &Arc<Self>) {
        let environment = Arc::clone(self);

        tokio::spawn(async move {
            let mut state = environment.events.subscribe_state();

            loop {
                let running = matches!(
                    environment.is_running().await,
                    Ok(true)
                );

                if running {
                    let options = StatsOptions {
                        stream: true,
                        one_shot: false,
                    };

                    let mut stats = environment.docker.stats(&environment.uuid, Some(options));
                    while let Some(sample) = stats.next().await {
                        match sample {
                            Ok(sample) => environment
                                .events
                                .publish_resources(resource_usage(&sample)),
                            Err(_) => break,
                        }
                    }
                }

                // Park until the next state transition. A closed channel means
                // the environment is being torn down.
                if state.recv().await.is_err() {
                    break;
                }
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn resource_usage(stats: &Stats) -> ResourceUsage {
    let (rx, tx) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), iface| {
                (rx + iface.rx_bytes, tx + iface.tx_bytes)
            })
        })
        .unwrap_or((0, 0));

    ResourceUsage {
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        cpu_absolute: cpu_percentage(stats),
        network_rx_bytes: rx,
        network_tx_bytes: tx,
    }
}

/// Absolute CPU usage where 100 means one full core, computed from the delta
/// between the current and previous samples the way the runtime CLI does.
fn cpu_percentage(stats: &Stats) -> f64 {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;

    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    let cores = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
    (cpu_delta / system_delta) * cores * 100.0
}
