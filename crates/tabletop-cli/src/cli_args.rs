use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tabletop_spatial::LocalTile;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_local_tile(value: &str) -> Result<LocalTile, String> {
    let (x, z) = value
        .split_once(',')
        .ok_or_else(|| format!("expected '<x>,<z>', got '{value}'"))?;
    let x = x
        .trim()
        .parse::<i32>()
        .map_err(|error| format!("failed to parse x coordinate: {error}"))?;
    let z = z
        .trim()
        .parse::<i32>()
        .map_err(|error| format!("failed to parse z coordinate: {error}"))?;
    Ok(LocalTile::new(x, z))
}

fn parse_json_value(value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|error| format!("failed to parse JSON: {error}"))
}

#[derive(Debug, Parser)]
#[command(
    name = "tabletop",
    about = "Operator tool for tabletop sidecar RPC and the combat spatial index",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "TABLETOP_CONFIG",
        default_value = "tabletop-bridge.json",
        help = "Bridge config file (JSON, schema_version 1)"
    )]
    pub config: PathBuf,

    #[arg(
        long = "binaries-dir",
        env = "TABLETOP_BINARIES_DIR",
        help = "Override the directory sidecar executables are resolved against"
    )]
    pub binaries_dir: Option<PathBuf>,

    #[arg(
        long = "request-timeout-ms",
        env = "TABLETOP_REQUEST_TIMEOUT_MS",
        value_parser = parse_positive_u64,
        help = "Override the per-request timeout in milliseconds"
    )]
    pub request_timeout_ms: Option<u64>,

    #[arg(
        long,
        help = "Sidecar server for --list-tools and --call-tool (defaults to the sync server)"
    )]
    pub server: Option<String>,

    #[arg(
        long = "list-tools",
        default_value_t = false,
        help = "Print the tools advertised by the sidecar server and exit"
    )]
    pub list_tools: bool,

    #[arg(
        long = "call-tool",
        conflicts_with = "list_tools",
        help = "Invoke one tool on the sidecar server and print its text output"
    )]
    pub call_tool: Option<String>,

    #[arg(
        long = "tool-args",
        default_value = "{}",
        value_parser = parse_json_value,
        requires = "call_tool",
        help = "JSON arguments object for --call-tool"
    )]
    pub tool_args: serde_json::Value,

    #[arg(
        long,
        default_value_t = false,
        conflicts_with_all = ["list_tools", "call_tool", "parse_report"],
        help = "Run one state sync cycle and print the report"
    )]
    pub sync: bool,

    #[arg(
        long = "parse-report",
        conflicts_with_all = ["list_tools", "call_tool"],
        help = "Parse a state report text file offline without starting any sidecar"
    )]
    pub parse_report: Option<PathBuf>,

    #[arg(
        long = "query-blocked",
        value_parser = parse_local_tile,
        allow_hyphen_values = true,
        help = "After --sync or --parse-report, report whether local tile <x>,<z> is blocked"
    )]
    pub query_blocked: Vec<LocalTile>,

    #[arg(
        long = "query-elevation",
        value_parser = parse_local_tile,
        allow_hyphen_values = true,
        help = "After --sync or --parse-report, report the elevation at local tile <x>,<z>"
    )]
    pub query_elevation: Vec<LocalTile>,

    #[arg(
        long = "query-nearest-open",
        value_parser = parse_local_tile,
        allow_hyphen_values = true,
        help = "After --sync or --parse-report, find the nearest open tile from <x>,<z>"
    )]
    pub query_nearest_open: Vec<LocalTile>,

    #[arg(
        long = "max-radius",
        default_value_t = 5,
        help = "Ring radius limit for --query-nearest-open"
    )]
    pub max_radius: u32,

    #[arg(
        long = "ignore-entity",
        value_delimiter = ',',
        help = "Entity ids ignored by occupancy and elevation queries"
    )]
    pub ignore_entity: Vec<String>,

    #[arg(
        long,
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Print parsed entities and terrain as JSON"
    )]
    pub json: bool,
}

impl Cli {
    pub fn has_queries(&self) -> bool {
        !self.query_blocked.is_empty()
            || !self.query_elevation.is_empty()
            || !self.query_nearest_open.is_empty()
    }
}
