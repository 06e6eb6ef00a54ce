use anyhow::Result;
use clap::Parser;
use fblaster::config::{self, Cli, Config};
use fblaster::runtime::DockerRuntime;
use fblaster::{controller, signals};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "fblaster=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // A secondary invocation that only pokes the running supervisor
    if cli.signal_poll {
        let directory = config::canonicalize(&cli.directory)?;
        let runtime = DockerRuntime::new(directory.clone());
        return match signals::send_poll_signal(&runtime, &directory).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("{e:#}");
                Err(e)
            },
        };
    }

    let configuration = Config::resolve(cli)?;
    info!("Starting fblaster in {}", configuration.directory.display());

    controller::run(configuration).await
}
