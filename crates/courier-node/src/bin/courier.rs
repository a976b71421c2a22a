use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use courier_node::cli::{self, Cli};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    ExitCode::from(cli::run(cli) as u8)
}
