use crate::runtime::{ContainerRuntime, HealthState};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a missing container id is re-queried.
const ID_RESOLVE_INTERVAL: Duration = Duration::from_secs(1);
/// Backoff after an inspection error that is not "no such container".
const INSPECT_RETRY: Duration = Duration::from_secs(10);

/// Per-service bookkeeping. Created with `last_healthy = now` so a service
/// gets a full tolerance window to come up before it can be flagged.
struct ServiceStatus {
    container_id: Option<String>,
    last_healthy: Instant,
}

/// Watches every service of the current derived manifest and emits the label
/// of any service whose unhealthy spell exceeds the tolerance.
///
/// Each respawn of the workload invalidates the watched service set, so the
/// monitor runs in generations: `rebind` cancels the previous generation's
/// tasks and starts fresh ones against the new manifest.
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    check_interval: Duration,
    tolerance: Duration,
    emissions: mpsc::Sender<String>,
    generation: Mutex<CancellationToken>,
    root: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        check_interval: Duration,
        tolerance: Duration,
        root: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (emissions, rx) = mpsc::channel(16);
        let monitor = Arc::new(Self {
            runtime,
            check_interval,
            tolerance,
            emissions,
            generation: Mutex::new(root.child_token()),
            root,
        });
        (monitor, rx)
    }

    /// Replace the monitored service set. The previous generation is
    /// cancelled before the new tasks start.
    pub fn rebind(&self, services: Vec<String>) {
        let generation = {
            let mut current = match self.generation.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            current.cancel();
            *current = self.root.child_token();
            current.clone()
        };

        info!("monitoring health of {} services", services.len());
        for label in services {
            tokio::spawn(monitor_service(
                Arc::clone(&self.runtime),
                label,
                self.check_interval,
                self.tolerance,
                self.emissions.clone(),
                generation.clone(),
            ));
        }
    }
}

async fn monitor_service(
    runtime: Arc<dyn ContainerRuntime>,
    label: String,
    check_interval: Duration,
    tolerance: Duration,
    emissions: mpsc::Sender<String>,
    token: CancellationToken,
) {
    let mut status = ServiceStatus {
        container_id: None,
        last_healthy: Instant::now(),
    };
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {},
        }

        // At most one inspection in flight: the next tick drops an
        // inspection that is still outstanding and starts over.
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                debug!("{label}: inspection overran its interval, restarting");
            },
            result = check_service(runtime.as_ref(), &label, &mut status) => {
                if let Err(e) = result {
                    warn!("{label}: health check failed: {e:#}");
                }
            },
        }

        if status.last_healthy.elapsed() > tolerance {
            debug!(
                "{label}: unhealthy for {}s, flagging for restart",
                status.last_healthy.elapsed().as_secs()
            );
            if emissions.send(label.clone()).await.is_err() {
                return;
            }
        }
    }
}

async fn check_service(
    runtime: &dyn ContainerRuntime,
    label: &str,
    status: &mut ServiceStatus,
) -> Result<()> {
    loop {
        let container_id = match &status.container_id {
            Some(id) => id.clone(),
            None => {
                let id = resolve_container_id(runtime, label).await;
                status.container_id = Some(id.clone());
                id
            },
        };

        match runtime.inspect_health(&container_id).await {
            Ok(HealthState::Healthy) => {
                status.last_healthy = Instant::now();
                return Ok(());
            },
            Ok(HealthState::Unhealthy) => return Ok(()),
            Ok(HealthState::Gone) => {
                // Stale id from a recent restart; rediscover next tick
                debug!("{label}: container {container_id} is gone, resetting");
                status.container_id = None;
                status.last_healthy = Instant::now();
                return Ok(());
            },
            Err(e) => {
                warn!(
                    "{label}: inspect failed ({e:#}), retrying in {}s",
                    INSPECT_RETRY.as_secs()
                );
                tokio::time::sleep(INSPECT_RETRY).await;
            },
        }
    }
}

/// Ask the runtime for the service's container id until one exists. Services
/// can take arbitrarily long to come up, so this never gives up on its own;
/// cancellation comes from the caller being dropped.
async fn resolve_container_id(runtime: &dyn ContainerRuntime, label: &str) -> String {
    loop {
        match runtime.container_id(label).await {
            Ok(Some(id)) if !id.is_empty() => return id,
            Ok(_) => {},
            Err(e) => debug!("{label}: container id lookup failed: {e:#}"),
        }
        tokio::time::sleep(ID_RESOLVE_INTERVAL).await;
    }
}

/// Consumes unhealthy-service emissions and restarts each flagged service,
/// at most one restart in flight per label. Distinct labels restart
/// concurrently.
pub async fn run_restart_loop(
    runtime: Arc<dyn ContainerRuntime>,
    mut emissions: mpsc::Receiver<String>,
    shutdown_timeout: Duration,
    token: CancellationToken,
) {
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        let label = tokio::select! {
            _ = token.cancelled() => return,
            label = emissions.recv() => match label {
                Some(label) => label,
                None => return,
            },
        };

        let claimed = match in_flight.lock() {
            Ok(mut set) => set.insert(label.clone()),
            Err(poisoned) => poisoned.into_inner().insert(label.clone()),
        };
        if !claimed {
            debug!("{label}: restart already in flight, dropping emission");
            continue;
        }

        let runtime = Arc::clone(&runtime);
        let in_flight = Arc::clone(&in_flight);
        tokio::spawn(async move {
            info!("restarting unhealthy service {label}");
            if let Err(e) = runtime.compose_restart(&label, shutdown_timeout).await {
                error!("failed to restart {label}: {e:#}");
            }
            match in_flight.lock() {
                Ok(mut set) => {
                    set.remove(&label);
                },
                Err(poisoned) => {
                    poisoned.into_inner().remove(&label);
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageRef;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime stub that reports a fixed health state and counts restarts.
    struct StubRuntime {
        health: HealthState,
        restarts: AtomicUsize,
        restart_delay: Duration,
    }

    impl StubRuntime {
        fn unhealthy(restart_delay: Duration) -> Self {
            Self {
                health: HealthState::Unhealthy,
                restarts: AtomicUsize::new(0),
                restart_delay,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for StubRuntime {
        async fn login(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn pull(&self, _: &ImageRef) -> Result<()> {
            Ok(())
        }
        fn compose_up_argv(&self) -> Vec<String> {
            vec!["true".to_string()]
        }
        async fn compose_stop(&self, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn compose_restart(&self, _: &str, _: Duration) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.restart_delay).await;
            Ok(())
        }
        async fn container_id(&self, service: &str) -> Result<Option<String>> {
            Ok(Some(format!("{service}-id")))
        }
        async fn inspect_health(&self, _: &str) -> Result<HealthState> {
            Ok(self.health)
        }
        async fn kill_signal(&self, _: &str, _: &str) -> Result<()> {
            Err(anyhow!("not used"))
        }
    }

    #[tokio::test]
    async fn test_healthy_service_is_never_flagged() {
        let runtime = Arc::new(StubRuntime {
            health: HealthState::Healthy,
            restarts: AtomicUsize::new(0),
            restart_delay: Duration::ZERO,
        });
        let root = CancellationToken::new();
        let (monitor, mut emissions) = HealthMonitor::new(
            runtime,
            Duration::from_millis(20),
            Duration::from_millis(50),
            root.clone(),
        );
        monitor.rebind(vec!["cat".to_string()]);

        let flagged =
            tokio::time::timeout(Duration::from_millis(300), emissions.recv()).await;
        assert!(flagged.is_err(), "healthy service was flagged");
        root.cancel();
    }

    #[tokio::test]
    async fn test_unhealthy_service_is_flagged_after_tolerance() {
        let runtime = Arc::new(StubRuntime::unhealthy(Duration::ZERO));
        let root = CancellationToken::new();
        let (monitor, mut emissions) = HealthMonitor::new(
            runtime,
            Duration::from_millis(20),
            Duration::from_millis(50),
            root.clone(),
        );
        monitor.rebind(vec!["dog".to_string()]);

        let flagged = tokio::time::timeout(Duration::from_secs(2), emissions.recv())
            .await
            .expect("no emission before timeout");
        assert_eq!(flagged.as_deref(), Some("dog"));
        root.cancel();
    }

    #[tokio::test]
    async fn test_restart_loop_coalesces_per_label() {
        let runtime = Arc::new(StubRuntime::unhealthy(Duration::from_millis(200)));
        let root = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);

        let loop_handle = tokio::spawn(run_restart_loop(
            runtime.clone(),
            rx,
            Duration::from_secs(1),
            root.clone(),
        ));

        // A burst of emissions for two labels while restarts are slow
        for _ in 0..5 {
            tx.send("cat".to_string()).await.unwrap();
            tx.send("dog".to_string()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.restarts.load(Ordering::SeqCst), 2);

        root.cancel();
        let _ = loop_handle.await;
    }

    #[tokio::test]
    async fn test_rebind_cancels_previous_generation() {
        let runtime = Arc::new(StubRuntime::unhealthy(Duration::ZERO));
        let root = CancellationToken::new();
        let (monitor, mut emissions) = HealthMonitor::new(
            runtime,
            Duration::from_millis(20),
            Duration::from_millis(40),
            root.clone(),
        );
        monitor.rebind(vec!["cat".to_string()]);
        monitor.rebind(vec!["dog".to_string()]);

        // Only the current generation's label may be emitted
        for _ in 0..3 {
            if let Ok(Some(label)) =
                tokio::time::timeout(Duration::from_secs(2), emissions.recv()).await
            {
                assert_eq!(label, "dog");
            }
        }
        root.cancel();
    }
}
