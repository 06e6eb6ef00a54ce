use crate::compose::{self, ComposeFile};
use crate::controller::compose_child::ComposeChild;
use crate::health::HealthMonitor;
use crate::models::ImageRef;
use crate::runtime::ContainerRuntime;
use crate::versions;
use anyhow::{Context, Result};
use futures::future::try_join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry pause for the pull and restart stages.
const STAGE_RETRY: Duration = Duration::from_secs(3);

/// Forward only the last value of each burst: a new arrival within `window`
/// replaces the pending one and restarts the timer.
pub fn debounce<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    window: Duration,
    token: CancellationToken,
) -> mpsc::Receiver<T> {
    let (tx, out) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            let mut pending = tokio::select! {
                _ = token.cancelled() => return,
                value = rx.recv() => match value {
                    Some(value) => value,
                    None => return,
                },
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    value = rx.recv() => match value {
                        Some(value) => pending = value,
                        None => {
                            let _ = tx.send(pending).await;
                            return;
                        },
                    },
                    _ = tokio::time::sleep(window) => break,
                }
            }
            if tx.send(pending).await.is_err() {
                return;
            }
        }
    });
    out
}

/// Consumes debounced tag-set snapshots and turns each into a deployed
/// upgrade: pull the changed images, respawn the workload from a freshly
/// merged manifest, persist the selected tags.
///
/// At most one upgrade is in flight; a newer snapshot supersedes and cancels
/// the one being applied, including its retry loops.
pub struct UpdatePipeline {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub compose_child: ComposeChild,
    pub health: Arc<HealthMonitor>,
    pub base: ComposeFile,
    pub dir: PathBuf,
    pub initial: Vec<ImageRef>,
    pub token: CancellationToken,
}

impl UpdatePipeline {
    pub async fn run(self, mut updates: mpsc::Receiver<Vec<ImageRef>>) -> Result<()> {
        // The initial set acts as the first "previous", so the very first
        // snapshot already forms a pair.
        let mut previous = self.initial.clone();

        loop {
            let mut next = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                snapshot = updates.recv() => match snapshot {
                    Some(snapshot) => snapshot,
                    None => return Ok(()),
                },
            };

            loop {
                tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    newer = updates.recv() => match newer {
                        Some(snapshot) => {
                            info!("newer tag set supersedes the upgrade in flight");
                            next = snapshot;
                        },
                        None => return Ok(()),
                    },
                    result = self.apply(previous.clone(), next.clone()) => {
                        result?;
                        previous = next;
                        break;
                    },
                }
            }
        }
    }

    async fn apply(&self, previous: Vec<ImageRef>, next: Vec<ImageRef>) -> Result<()> {
        let changed = changed_refs(&previous, &next);
        if changed.is_empty() {
            debug!("snapshot carries no tag changes, nothing to do");
            return Ok(());
        }
        info!(
            "upgrading {}",
            changed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        // Pull-stage: fetch every changed image before touching the workload
        loop {
            let pulls = changed.iter().map(|image| self.runtime.pull(image));
            match try_join_all(pulls).await {
                Ok(_) => break,
                Err(e) => {
                    warn!(
                        "image pull failed ({e:#}), retrying in {}s",
                        STAGE_RETRY.as_secs()
                    );
                    tokio::time::sleep(STAGE_RETRY).await;
                },
            }
        }

        // Restart-stage: always merge onto the original manifest so derived
        // manifests never accumulate drift.
        let derived = self.base.merge(&next);
        loop {
            match self.restart_workload(&derived).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "workload restart failed ({e:#}), retrying in {}s",
                        STAGE_RETRY.as_secs()
                    );
                    tokio::time::sleep(STAGE_RETRY).await;
                },
            }
        }

        // Persist-stage: deliberately after the respawn; on a crash in
        // between, the version store wins on the next start.
        versions::save(&self.dir, &next)
            .await
            .context("persisting selected versions failed")?;
        info!("upgrade complete");
        Ok(())
    }

    async fn restart_workload(&self, derived: &ComposeFile) -> Result<()> {
        compose::write_derived(&self.dir, derived).await?;
        self.compose_child.respawn().await?;
        self.health.rebind(derived.service_names());
        Ok(())
    }
}

/// References in `next` whose tag differs from their `previous` counterpart.
fn changed_refs(previous: &[ImageRef], next: &[ImageRef]) -> Vec<ImageRef> {
    next.iter()
        .filter(|n| {
            previous
                .iter()
                .any(|p| p.same_image(n) && p.tag != n.tag)
        })
        .cloned()
        .collect()
}
