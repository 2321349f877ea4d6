use anyhow::{Context, Result};
use tabletop_bridge::{load_bridge_config_file, validate_bridge_config, BridgeConfigFile};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::Cli;

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Loads the bridge config and applies command-line overrides.
pub(crate) fn resolve_bridge_config(cli: &Cli) -> Result<BridgeConfigFile> {
    let mut config = load_bridge_config_file(&cli.config)?;
    if let Some(binaries_dir) = &cli.binaries_dir {
        config.binaries_dir = binaries_dir.clone();
    }
    if let Some(timeout_ms) = cli.request_timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    validate_bridge_config(&config)
        .with_context(|| format!("invalid overrides for {}", cli.config.display()))?;
    tracing::debug!(
        config = %cli.config.display(),
        servers = config.servers.len(),
        timeout_ms = config.request_timeout_ms,
        "bridge config loaded"
    );
    Ok(config)
}
