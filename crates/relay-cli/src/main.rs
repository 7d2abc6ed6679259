mod bootstrap_helpers;
mod cli_args;

use std::io::IsTerminal;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::bootstrap_helpers::{build_gateway_config, init_tracing};
use crate::cli_args::Cli;

/// Bound on waiting for a stdin read still blocked on its worker thread.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    let config = build_gateway_config(&cli, std::io::stdin().is_terminal())?;
    info!(
        bind = %config.bind,
        services_file = %config.services_file.display(),
        auth_mode = cli.auth_mode.as_str(),
        stdio = config.stdio_enabled,
        "starting relay gateway"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(relay_gateway::run_gateway_server(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}
