mod bootstrap_helpers;
mod cli_args;
mod cli_commands;

use anyhow::Result;
use clap::Parser;

pub(crate) use bootstrap_helpers::{init_tracing, resolve_bridge_config};
pub(crate) use cli_args::Cli;
pub(crate) use cli_commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}
