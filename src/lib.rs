// Library exports for integration testing
//
// This file exposes internal modules for integration tests while keeping
// the binary entrypoint in main.rs

pub mod compose;
pub mod config;
pub mod controller;
pub mod health;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod signals;
pub mod versions;

// Re-export commonly used types for testing
pub use compose::{ComposeFile, ManifestError};
pub use config::{Cli, Config, ConfigError, Credentials};
pub use models::{ImageRef, TrackedImages};
pub use registry::select_upgrade;
pub use runtime::{ContainerRuntime, HealthState};
