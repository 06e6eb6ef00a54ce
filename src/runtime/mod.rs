use crate::compose::DERIVED_COMPOSE_FILE;
use crate::models::ImageRef;
use crate::process;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Observed health of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No health check configured, or the check is passing.
    Healthy,
    /// The runtime reports the container as unhealthy.
    Unhealthy,
    /// The container id no longer resolves; it was likely replaced.
    Gone,
}

/// The orchestration runtime the supervisor drives: image pulls, registry
/// logins, compose lifecycle commands and container inspection.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn login(&self, registry: &str, username: &str, password: &str) -> Result<()>;

    async fn pull(&self, image: &ImageRef) -> Result<()>;

    /// Command line that runs the workload from the derived manifest.
    fn compose_up_argv(&self) -> Vec<String>;

    /// Defensive stop of whatever the compose child may have left behind.
    async fn compose_stop(&self, timeout: Duration) -> Result<()>;

    async fn compose_restart(&self, service: &str, timeout: Duration) -> Result<()>;

    /// Container id for a service label, `None` while it is not up yet.
    async fn container_id(&self, service: &str) -> Result<Option<String>>;

    async fn inspect_health(&self, container_id: &str) -> Result<HealthState>;

    /// Deliver a named signal to a container.
    async fn kill_signal(&self, container: &str, signal: &str) -> Result<()>;
}

/// Adapter over the `docker` and `docker-compose` command-line tools.
pub struct DockerRuntime {
    dir: PathBuf,
}

impl DockerRuntime {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn compose_argv(&self, tail: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "docker-compose".to_string(),
            "-f".to_string(),
            DERIVED_COMPOSE_FILE.to_string(),
        ];
        argv.extend(tail.iter().map(|s| s.to_string()));
        argv
    }
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Health")]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
struct InspectHealth {
    #[serde(rename = "Status")]
    status: String,
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn login(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        debug!("logging {username} into {registry}");
        let argv = vec![
            "docker".to_string(),
            "login".to_string(),
            "-u".to_string(),
            username.to_string(),
            "-p".to_string(),
            password.to_string(),
            registry.to_string(),
        ];
        process::run_capture(&argv, &self.dir).await.map(drop)
    }

    async fn pull(&self, image: &ImageRef) -> Result<()> {
        debug!("pulling {image}");
        let argv = vec!["docker".to_string(), "pull".to_string(), image.to_string()];
        process::run_capture(&argv, &self.dir).await.map(drop)
    }

    fn compose_up_argv(&self) -> Vec<String> {
        self.compose_argv(&["up"])
    }

    async fn compose_stop(&self, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        let argv = self.compose_argv(&["stop", "-t", &secs]);
        process::run_capture(&argv, &self.dir).await.map(drop)
    }

    async fn compose_restart(&self, service: &str, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        let argv = self.compose_argv(&["restart", "-t", &secs, service]);
        process::run_capture(&argv, &self.dir).await.map(drop)
    }

    async fn container_id(&self, service: &str) -> Result<Option<String>> {
        let argv = self.compose_argv(&["ps", "-q", service]);
        let out = process::run_capture(&argv, &self.dir).await?;
        Ok(out.lines().map(str::trim).find(|l| !l.is_empty()).map(String::from))
    }

    async fn inspect_health(&self, container_id: &str) -> Result<HealthState> {
        let argv = vec![
            "docker".to_string(),
            "inspect".to_string(),
            container_id.to_string(),
        ];
        let out = match process::run_capture(&argv, &self.dir).await {
            Ok(out) => out,
            Err(e) if is_no_such_container(&e) => return Ok(HealthState::Gone),
            Err(e) => return Err(e),
        };

        let entries: Vec<InspectEntry> =
            serde_json::from_str(&out).context("unparseable docker inspect output")?;
        let Some(entry) = entries.first() else {
            return Ok(HealthState::Gone);
        };
        Ok(parse_health_status(entry.state.health.as_ref().map(|h| h.status.as_str())))
    }

    async fn kill_signal(&self, container: &str, signal: &str) -> Result<()> {
        let argv = vec![
            "docker".to_string(),
            "kill".to_string(),
            "--signal".to_string(),
            signal.to_string(),
            container.to_string(),
        ];
        process::run_capture(&argv, &self.dir).await.map(drop)
    }
}

fn is_no_such_container(error: &anyhow::Error) -> bool {
    format!("{error}").to_lowercase().contains("no such")
}

fn parse_health_status(status: Option<&str>) -> HealthState {
    match status {
        Some("unhealthy") => HealthState::Unhealthy,
        // No health check configured, starting, or passing
        _ => HealthState::Healthy,
    }
}
