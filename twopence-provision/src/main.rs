//! twopence-provision - provision test topologies on vagrant and podman
//!
//! A workspace is created once with `init`, naming the backend and the
//! configuration fragments; every later command reloads the configuration
//! from the workspace BOM and works on the instances recorded in its status
//! file.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "twopence_provision=debug,twopence_topology=debug,twopence_config=debug,twopence_curly=debug"
    } else {
        "twopence_provision=info,twopence_topology=info,twopence_config=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    commands::execute(cli).await
}
