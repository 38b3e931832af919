use anyhow::Context;
use clap::Parser;
use crossbar_core::{ConnectionFactory, FactoryConfig};
use crossbar_echod::EchoConnectionBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "crossbar-echod")]
#[command(version, about = "Echo server on the crossbar connection factory", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:7878")]
    listen: SocketAddr,

    /// Maximum concurrent connections per client IP (0 = unlimited)
    #[arg(long, default_value = "60")]
    max_client_cnxns: usize,

    /// Override the number of selector threads
    #[arg(long)]
    selectors: Option<usize>,

    /// Override the number of I/O worker threads (0 = inline I/O)
    #[arg(long)]
    workers: Option<usize>,

    /// Override the sessionless connection timeout in ms
    #[arg(long)]
    sessionless_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = FactoryConfig::from_env();
    if let Some(selectors) = cli.selectors {
        config.num_selector_threads = selectors;
    }
    if let Some(workers) = cli.workers {
        config.num_worker_threads = workers;
    }
    if let Some(timeout) = cli.sessionless_timeout {
        config.sessionless_cnxn_timeout = timeout;
    }

    let mut factory = ConnectionFactory::new(Arc::new(EchoConnectionBuilder));
    factory
        .configure_with(cli.listen, cli.max_client_cnxns, false, config)
        .context("failed to configure connection factory")?;
    factory.start().context("failed to start connection factory")?;

    tracing::info!(
        "echo server listening on {}",
        factory.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    // Serves until the process is terminated (or a thread failure cascades a
    // factory-wide stop)
    factory.join();
    Ok(())
}
