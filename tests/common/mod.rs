// Common test utilities for integration tests
//
// Provides a recording ContainerRuntime stub and compose manifest fixtures
// so pipeline and health scenarios run without a real docker daemon.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use fblaster::models::ImageRef;
use fblaster::runtime::{ContainerRuntime, HealthState};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub const MANIFEST: &str = r#"
version: "3"
services:
  cat:
    image: reg:7420/cat-image:10.0.0
    restart: always
  dog:
    image: reg:7420/dog-image:10.0.0
    environment:
      KIND: good
  redis:
    image: redis:5.0-alpine
"#;

/// Writes the fixture manifest into a fresh working directory.
pub fn write_manifest(dir: &Path) {
    std::fs::write(dir.join("docker-compose.yml"), MANIFEST).unwrap();
}

/// Runtime stub that records every interaction and answers health lookups
/// from a configurable per-service table.
pub struct RecordingRuntime {
    pub pulls: Mutex<Vec<String>>,
    pub stops: Mutex<usize>,
    pub restarts: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<(String, String)>>,
    pub health: Mutex<HashMap<String, HealthState>>,
    pub restart_delay: Duration,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self {
            pulls: Mutex::new(Vec::new()),
            stops: Mutex::new(0),
            restarts: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            health: Mutex::new(HashMap::new()),
            restart_delay: Duration::ZERO,
        }
    }

    pub fn with_health(services: &[(&str, HealthState)], restart_delay: Duration) -> Self {
        let runtime = Self::new();
        {
            let mut health = runtime.health.lock().unwrap();
            for (service, state) in services {
                health.insert(service.to_string(), *state);
            }
        }
        Self {
            restart_delay,
            ..runtime
        }
    }

    pub fn pulled(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        *self.stops.lock().unwrap()
    }

    pub fn restarted(&self) -> Vec<String> {
        self.restarts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn login(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn pull(&self, image: &ImageRef) -> Result<()> {
        self.pulls.lock().unwrap().push(image.to_string());
        Ok(())
    }

    fn compose_up_argv(&self) -> Vec<String> {
        // A quiet long-running stand-in for `docker-compose up`
        vec!["sleep".to_string(), "300".to_string()]
    }

    async fn compose_stop(&self, _: Duration) -> Result<()> {
        *self.stops.lock().unwrap() += 1;
        Ok(())
    }

    async fn compose_restart(&self, service: &str, _: Duration) -> Result<()> {
        self.restarts.lock().unwrap().push(service.to_string());
        tokio::time::sleep(self.restart_delay).await;
        Ok(())
    }

    async fn container_id(&self, service: &str) -> Result<Option<String>> {
        Ok(Some(format!("{service}-container")))
    }

    async fn inspect_health(&self, container_id: &str) -> Result<HealthState> {
        let service = container_id.trim_end_matches("-container");
        let health = self.health.lock().unwrap();
        Ok(health.get(service).copied().unwrap_or(HealthState::Healthy))
    }

    async fn kill_signal(&self, container: &str, signal: &str) -> Result<()> {
        self.killed
            .lock()
            .unwrap()
            .push((container.to_string(), signal.to_string()));
        Ok(())
    }
}
