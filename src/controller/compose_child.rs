use crate::process::{self, ChildHandle};
use crate::runtime::ContainerRuntime;
use anyhow::{Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pause before respawning a child that died on its own.
const CRASH_RESPAWN_DELAY: Duration = Duration::from_secs(1);

enum Command {
    Respawn { reply: oneshot::Sender<Result<()>> },
    Shutdown { reply: oneshot::Sender<()> },
}

enum Event {
    Command(Option<Command>),
    Exited(Result<()>),
}

/// Handle to the task that exclusively owns the orchestration child.
///
/// All child lifecycle changes go through this one task, which serializes
/// them: there is never more than one respawn in flight.
#[derive(Clone)]
pub struct ComposeChild {
    tx: mpsc::Sender<Command>,
}

impl ComposeChild {
    /// Replace the running workload with one spawned from the current
    /// derived manifest: graceful stop, defensive `compose stop`, spawn.
    pub async fn respawn(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Respawn { reply })
            .await
            .map_err(|_| anyhow!("compose supervisor is gone"))?;
        rx.await
            .map_err(|_| anyhow!("compose supervisor dropped the respawn request"))?
    }

    /// Stop the workload and the owning task. Safe to call once.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the initial child and the task owning it. Failing to start the
/// workload at all is a startup error.
pub fn start(
    runtime: Arc<dyn ContainerRuntime>,
    dir: PathBuf,
    shutdown_timeout: Duration,
) -> Result<(ComposeChild, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(4);
    let mut actor = Actor {
        runtime,
        dir,
        shutdown_timeout,
        child: None,
        rx,
    };
    actor.spawn_child()?;
    let join = tokio::spawn(actor.run());
    Ok((ComposeChild { tx }, join))
}

struct Actor {
    runtime: Arc<dyn ContainerRuntime>,
    dir: PathBuf,
    shutdown_timeout: Duration,
    child: Option<ChildHandle>,
    rx: mpsc::Receiver<Command>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                cmd = self.rx.recv() => Event::Command(cmd),
                result = wait_for_exit(&mut self.child) => Event::Exited(result),
            };

            match event {
                Event::Command(Some(Command::Respawn { reply })) => {
                    let result = self.respawn().await;
                    let _ = reply.send(result);
                },
                Event::Command(Some(Command::Shutdown { reply })) => {
                    info!("stopping workload");
                    self.stop_workload().await;
                    let _ = reply.send(());
                    return;
                },
                Event::Command(None) => {
                    self.stop_workload().await;
                    return;
                },
                Event::Exited(result) => {
                    self.child = None;
                    match result {
                        Ok(()) => warn!("compose child exited unexpectedly"),
                        Err(e) => error!("compose child failed: {e:#}"),
                    }
                    tokio::time::sleep(CRASH_RESPAWN_DELAY).await;
                    if let Err(e) = self.respawn().await {
                        // The next pipeline-driven respawn retries the spawn
                        error!("could not respawn workload: {e:#}");
                    }
                },
            }
        }
    }

    async fn respawn(&mut self) -> Result<()> {
        self.stop_workload().await;
        self.spawn_child()
    }

    fn spawn_child(&mut self) -> Result<()> {
        let argv = self.runtime.compose_up_argv();
        info!("starting workload: {}", argv.join(" "));
        self.child = Some(process::spawn(&argv, &self.dir)?);
        Ok(())
    }

    async fn stop_workload(&mut self) {
        if let Some(child) = self.child.take() {
            if let Err(e) = child.shutdown(self.shutdown_timeout).await {
                warn!("stopping compose child: {e:#}");
            }
        }
        // The child routinely leaves containers behind; stop them too.
        if let Err(e) = self.runtime.compose_stop(self.shutdown_timeout).await {
            warn!("defensive compose stop failed: {e:#}");
        }
    }
}

async fn wait_for_exit(child: &mut Option<ChildHandle>) -> Result<()> {
    match child {
        Some(c) => c.wait().await,
        None => std::future::pending().await,
    }
}
