use crate::runtime::ContainerRuntime;
use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::path::Path;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Signal that forces an immediate registry poll.
const POLL_SIGNAL_NAME: &str = "SIGUSR2";

/// Container name prefix shared with the external launcher.
const CONTAINER_PREFIX: &str = "fblaster";

/// Install the process-wide poll-signal subscription and broadcast each
/// delivery as a poke. Installed once at startup; every per-image poll loop
/// subscribes to the returned sender.
pub fn start_poke_listener(token: CancellationToken) -> Result<broadcast::Sender<()>> {
    let (tx, _) = broadcast::channel(16);
    let mut stream =
        signal(SignalKind::user_defined2()).context("cannot install poll signal handler")?;

    let poke = tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                received = stream.recv() => match received {
                    Some(()) => {
                        info!("poll signal received");
                        let _ = poke.send(());
                    },
                    None => return,
                },
            }
        }
    });
    Ok(tx)
}

/// Name of the container the running supervisor lives in, as assigned by the
/// external launcher: a stable hash of the absolute working directory.
pub fn peer_container_name(dir: &Path) -> String {
    let digest = Md5::digest(dir.to_string_lossy().as_bytes());
    format!("{CONTAINER_PREFIX}-{}", hex::encode(digest))
}

/// Deliver the poll signal to the supervisor owning `dir`, through the
/// orchestration runtime. Used by the `--signal-poll` invocation.
pub async fn send_poll_signal(runtime: &dyn ContainerRuntime, dir: &Path) -> Result<()> {
    let peer = peer_container_name(dir);
    runtime
        .kill_signal(&peer, POLL_SIGNAL_NAME)
        .await
        .with_context(|| format!("could not deliver {POLL_SIGNAL_NAME} to {peer}"))
}
