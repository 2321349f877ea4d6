use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tabletop_rpc::{ClientInfo, ServerRegistry, SidecarServerConfig};

pub const BRIDGE_CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SYNC_SERVER: &str = "game-state";
pub const DEFAULT_SYNC_TOOL: &str = "get_combat_state";

fn default_binaries_dir() -> PathBuf {
    PathBuf::from("bin")
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_sync_server() -> String {
    DEFAULT_SYNC_SERVER.to_string()
}

fn default_sync_tool() -> String {
    DEFAULT_SYNC_TOOL.to_string()
}

fn default_sync_arguments() -> Value {
    json!({})
}

/// Tool invoked by one sync cycle to fetch the text state report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_server")]
    pub server: String,
    #[serde(default = "default_sync_tool")]
    pub tool: String,
    #[serde(default = "default_sync_arguments")]
    pub arguments: Value,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server: default_sync_server(),
            tool: default_sync_tool(),
            arguments: default_sync_arguments(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfigFile {
    pub schema_version: u32,
    /// Relative paths resolve against the config file's directory when loaded.
    #[serde(default = "default_binaries_dir")]
    pub binaries_dir: PathBuf,
    #[serde(default)]
    pub servers: Vec<SidecarServerConfig>,
    #[serde(default)]
    pub client_info: ClientInfo,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for BridgeConfigFile {
    fn default() -> Self {
        Self {
            schema_version: BRIDGE_CONFIG_SCHEMA_VERSION,
            binaries_dir: default_binaries_dir(),
            servers: vec![SidecarServerConfig::new(DEFAULT_SYNC_SERVER)],
            client_info: ClientInfo::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            sync: SyncConfig::default(),
        }
    }
}

impl BridgeConfigFile {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn registry(&self) -> Result<ServerRegistry> {
        ServerRegistry::from_configs(self.binaries_dir.clone(), self.servers.iter().cloned())
            .context("invalid sidecar server list")
    }
}

pub fn load_bridge_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bridge config {}", path.display()))?;
    let mut parsed = serde_json::from_str::<BridgeConfigFile>(&raw)
        .with_context(|| format!("failed to parse bridge config {}", path.display()))?;
    if parsed.binaries_dir.is_relative() {
        if let Some(parent) = path.parent() {
            parsed.binaries_dir = parent.join(&parsed.binaries_dir);
        }
    }
    validate_bridge_config(&parsed)
        .with_context(|| format!("invalid bridge config {}", path.display()))?;
    Ok(parsed)
}

pub fn validate_bridge_config(config: &BridgeConfigFile) -> Result<()> {
    if config.schema_version != BRIDGE_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported bridge config schema_version {} (expected {})",
            config.schema_version,
            BRIDGE_CONFIG_SCHEMA_VERSION
        );
    }
    if config.request_timeout_ms == 0 {
        bail!("bridge config request_timeout_ms must be greater than 0");
    }
    let mut seen = BTreeSet::new();
    for server in &config.servers {
        let name = server.name.trim();
        if name.is_empty() {
            bail!("bridge config server name must not be empty");
        }
        if !seen.insert(name) {
            bail!("bridge config server '{name}' is declared more than once");
        }
    }
    let registry = config.registry()?;
    if !registry.contains(config.sync.server.trim()) {
        bail!(
            "bridge config sync server '{}' is not an enabled server",
            config.sync.server
        );
    }
    if config.sync.tool.trim().is_empty() {
        bail!("bridge config sync tool must not be empty");
    }
    Ok(())
}
