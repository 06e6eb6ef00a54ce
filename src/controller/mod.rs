pub mod compose_child;

use crate::compose;
use crate::config::Config;
use crate::health::{self, HealthMonitor};
use crate::pipeline::{self, UpdatePipeline};
use crate::registry::{RegistryClient, RegistryPoller};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::signals;
use crate::versions;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bring the workload up from the manifest and supervise it until a
/// termination signal arrives or the update pipeline dies.
pub async fn run(config: Config) -> Result<()> {
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(config.directory.clone()));
    run_with_runtime(config, runtime).await
}

async fn run_with_runtime(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<()> {
    // Log in to every registry we have credentials for before anything may
    // need to pull from them.
    for (registry, creds) in &config.credentials {
        runtime
            .login(registry, &creds.username, &creds.password)
            .await
            .with_context(|| format!("login to {registry} failed"))?;
    }

    let base = compose::load_base(&config.directory).await?;
    let initial = base.extract_tracked(&config.tracked);
    info!("tracking {} of {} services", initial.len(), base.services.len());

    // Persisted tags win over the manifest's
    let effective = match versions::load(&config.directory).await? {
        Some(loaded) => versions::reconcile(&initial, &loaded),
        None => initial.clone(),
    };

    let derived = base.merge(&effective);
    compose::write_derived(&config.directory, &derived).await?;

    // Everything that can fail is set up before the workload starts, so a
    // startup error never leaves an unsupervised child behind.
    let root = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let poke = signals::start_poke_listener(root.child_token())?;
    let client = Arc::new(RegistryClient::new(
        config.credentials.clone(),
        config.insecure,
    )?);

    let (compose_child, child_join) = compose_child::start(
        Arc::clone(&runtime),
        config.directory.clone(),
        config.shutdown_timeout,
    )?;

    let (monitor, emissions) = HealthMonitor::new(
        Arc::clone(&runtime),
        config.health_check_interval,
        config.ill_health_tolerance,
        root.clone(),
    );
    monitor.rebind(derived.service_names());
    let restart_join = tokio::spawn(health::run_restart_loop(
        Arc::clone(&runtime),
        emissions,
        config.shutdown_timeout,
        root.child_token(),
    ));

    let snapshots = RegistryPoller::new(client, config.poll_interval).start(
        effective.clone(),
        &poke,
        root.child_token(),
    );
    let debounced = pipeline::debounce(snapshots, config.debounce, root.child_token());

    let update_pipeline = UpdatePipeline {
        runtime: Arc::clone(&runtime),
        compose_child: compose_child.clone(),
        health: Arc::clone(&monitor),
        base,
        dir: config.directory.clone(),
        initial: effective,
        token: root.child_token(),
    };
    let mut pipeline_join = tokio::spawn(update_pipeline.run(debounced));

    info!("fblaster is running");

    let result = tokio::select! {
        _ = sigint.recv() => {
            info!("interrupt received");
            Ok(())
        },
        _ = sigterm.recv() => {
            info!("termination requested");
            Ok(())
        },
        finished = &mut pipeline_join => match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("update pipeline failed: {e:#}");
                Err(e)
            },
            Err(e) => Err(anyhow!("update pipeline panicked: {e}")),
        },
    };

    // Single shutdown path: cancel every long-running task, then stop the
    // workload through its owning task.
    info!("shutting down");
    root.cancel();
    compose_child.shutdown().await;
    let _ = child_join.await;
    pipeline_join.abort();
    restart_join.abort();
    info!("shutdown complete");

    result
}
