//! Logical sidecar server names and their launch resolution.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::RpcError;

fn default_server_enabled() -> bool {
    true
}

/// One configured sidecar server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarServerConfig {
    pub name: String,
    /// Executable name relative to the binaries directory, or an absolute path.
    /// Defaults to the server name.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
}

impl SidecarServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            enabled: true,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Fully resolved process launch for one sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarLaunch {
    pub server: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Registry mapping logical server names to executables in a binaries directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRegistry {
    binaries_dir: PathBuf,
    servers: Vec<SidecarServerConfig>,
}

impl ServerRegistry {
    pub fn new(binaries_dir: impl Into<PathBuf>) -> Self {
        Self {
            binaries_dir: binaries_dir.into(),
            servers: Vec::new(),
        }
    }

    /// Builds a registry from configured servers; disabled entries are dropped.
    pub fn from_configs(
        binaries_dir: impl Into<PathBuf>,
        configs: impl IntoIterator<Item = SidecarServerConfig>,
    ) -> Result<Self, RpcError> {
        configs
            .into_iter()
            .filter(|config| config.enabled)
            .try_fold(Self::new(binaries_dir), Self::with_server)
    }

    pub fn with_server(mut self, mut config: SidecarServerConfig) -> Result<Self, RpcError> {
        config.name = normalize_server_name(&config.name)?;
        if self.servers.iter().any(|server| server.name == config.name) {
            return Err(RpcError::Config {
                detail: format!("duplicate sidecar server '{}'", config.name),
            });
        }
        if config
            .command
            .as_deref()
            .is_some_and(|command| command.trim().is_empty())
        {
            return Err(RpcError::Config {
                detail: format!("sidecar server '{}' has an empty command", config.name),
            });
        }
        self.servers.push(config);
        Ok(self)
    }

    pub fn binaries_dir(&self) -> &Path {
        &self.binaries_dir
    }

    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(|server| server.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.iter().any(|server| server.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Result<SidecarLaunch, RpcError> {
        let config = self
            .servers
            .iter()
            .find(|server| server.name == name)
            .ok_or_else(|| RpcError::UnknownServer {
                server: name.to_string(),
            })?;
        let command = config.command.as_deref().unwrap_or(config.name.as_str());
        Ok(SidecarLaunch {
            server: config.name.clone(),
            program: resolve_program_path(&self.binaries_dir, command),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
        })
    }
}

fn resolve_program_path(binaries_dir: &Path, command: &str) -> PathBuf {
    let command = command.trim();
    let candidate = Path::new(command);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    let suffix = std::env::consts::EXE_SUFFIX;
    if suffix.is_empty() || command.ends_with(suffix) {
        binaries_dir.join(command)
    } else {
        binaries_dir.join(format!("{command}{suffix}"))
    }
}

fn normalize_server_name(raw: &str) -> Result<String, RpcError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RpcError::Config {
            detail: "sidecar server name must be non-empty".to_string(),
        });
    }
    let mut normalized = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
            normalized.push(ch.to_ascii_lowercase());
        } else {
            return Err(RpcError::Config {
                detail: format!(
                    "sidecar server name '{trimmed}' must contain only ASCII letters, digits, '-' or '_'"
                ),
            });
        }
    }
    Ok(normalized)
}
