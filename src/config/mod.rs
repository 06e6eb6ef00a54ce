use crate::models::TrackedImages;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Supervises a docker-compose workload and upgrades tracked images as
/// compatible newer tags appear in their registries.
#[derive(Parser, Debug)]
#[command(name = "fblaster")]
#[command(version)]
pub struct Cli {
    /// Comma-separated images to track, bare name or registry/image
    #[arg(short = 'i', long, value_delimiter = ',')]
    pub images: Vec<String>,

    /// Credentials file for a registry as registry:path, repeatable
    #[arg(short = 'c', long = "credentials")]
    pub credentials: Vec<String>,

    /// Working directory containing docker-compose.yml
    #[arg(short = 'd', long, default_value = ".")]
    pub directory: PathBuf,

    /// Seconds to wait for graceful shutdown
    #[arg(short = 's', long, default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Seconds between registry polls
    #[arg(short = 'I', long, default_value_t = 60)]
    pub poll_interval: u64,

    /// Quiet seconds required before acting on tag changes
    #[arg(short = 'D', long, default_value_t = 60)]
    pub debounce: u64,

    /// Seconds between container health checks
    #[arg(short = 'H', long, default_value_t = 60)]
    pub health_check_interval: u64,

    /// Unhealthy seconds tolerated before a service is restarted
    #[arg(short = 't', long, default_value_t = 60)]
    pub ill_health_tolerance: u64,

    /// Accept self-signed registry certificates
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// Poke the supervisor running in this directory to poll now, then exit
    #[arg(short = 'S', long)]
    pub signal_poll: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no tracked images configured")]
    NoTrackedImages,
    #[error("invalid credentials argument '{0}', expected registry:path")]
    InvalidCredentialSpec(String),
    #[error("credentials file {0} is outside the working directory")]
    CredentialsOutsideDir(PathBuf),
    #[error("credentials file {0} must contain a single username:password line")]
    MalformedCredentials(PathBuf),
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Login for one registry, read from its credentials file.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub directory: PathBuf,
    pub tracked: TrackedImages,
    pub credentials: HashMap<String, Credentials>,
    pub shutdown_timeout: Duration,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub health_check_interval: Duration,
    pub ill_health_tolerance: Duration,
    pub insecure: bool,
}

impl Config {
    pub fn resolve(cli: Cli) -> Result<Self, ConfigError> {
        let directory = canonicalize(&cli.directory)?;

        let images: Vec<String> = cli
            .images
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if images.is_empty() {
            return Err(ConfigError::NoTrackedImages);
        }

        let mut credentials = HashMap::new();
        for spec in &cli.credentials {
            let (registry, path) = parse_credential_spec(spec)?;
            let path = resolve_inside(&directory, &path)?;
            credentials.insert(registry, read_credentials(&path)?);
        }

        Ok(Self {
            directory,
            tracked: TrackedImages::new(images),
            credentials,
            shutdown_timeout: Duration::from_secs(cli.shutdown_timeout),
            poll_interval: Duration::from_secs(cli.poll_interval),
            debounce: Duration::from_secs(cli.debounce),
            health_check_interval: Duration::from_secs(cli.health_check_interval),
            ill_health_tolerance: Duration::from_secs(cli.ill_health_tolerance),
            insecure: cli.insecure,
        })
    }
}

pub fn canonicalize(path: &PathBuf) -> Result<PathBuf, ConfigError> {
    path.canonicalize().map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })
}

/// Split on the last colon so `host:port` registries parse as expected.
fn parse_credential_spec(spec: &str) -> Result<(String, PathBuf), ConfigError> {
    match spec.rsplit_once(':') {
        Some((registry, path)) if !registry.is_empty() && !path.is_empty() => {
            Ok((registry.to_string(), PathBuf::from(path)))
        },
        _ => Err(ConfigError::InvalidCredentialSpec(spec.to_string())),
    }
}

fn resolve_inside(directory: &PathBuf, path: &PathBuf) -> Result<PathBuf, ConfigError> {
    let joined = if path.is_absolute() {
        path.clone()
    } else {
        directory.join(path)
    };
    let resolved = canonicalize(&joined)?;
    if !resolved.starts_with(directory) {
        return Err(ConfigError::CredentialsOutsideDir(resolved));
    }
    Ok(resolved)
}

fn read_credentials(path: &PathBuf) -> Result<Credentials, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let line = text.lines().next().unwrap_or("").trim();
    match line.split_once(':') {
        Some((username, password)) if !username.is_empty() && !password.is_empty() => {
            Ok(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
        },
        _ => Err(ConfigError::MalformedCredentials(path.clone())),
    }
}
