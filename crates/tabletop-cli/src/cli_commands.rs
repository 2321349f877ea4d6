use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tabletop_bridge::{SyncReport, TabletopBridge};
use tabletop_rpc::ToolDescriptor;
use tabletop_spatial::{
    parse_state_text, LocalTile, ParseDiagnostic, ParsedState, SpatialIndex, SpatialSnapshot,
};

use crate::{resolve_bridge_config, Cli};

/// Spatial queries requested on the command line, answered against one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SpatialQueries {
    pub(crate) blocked: Vec<LocalTile>,
    pub(crate) elevation: Vec<LocalTile>,
    pub(crate) nearest_open: Vec<LocalTile>,
    pub(crate) max_radius: u32,
    pub(crate) ignore_entity_ids: Vec<String>,
}

impl SpatialQueries {
    pub(crate) fn from_cli(cli: &Cli) -> Self {
        Self {
            blocked: cli.query_blocked.clone(),
            elevation: cli.query_elevation.clone(),
            nearest_open: cli.query_nearest_open.clone(),
            max_radius: cli.max_radius,
            ignore_entity_ids: cli.ignore_entity.clone(),
        }
    }
}

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    if let Some(path) = &cli.parse_report {
        return run_parse_report(&cli, path);
    }
    if !(cli.sync || cli.list_tools || cli.call_tool.is_some()) {
        bail!("nothing to do: pass --sync, --parse-report, --list-tools or --call-tool");
    }
    if cli.has_queries() && !cli.sync {
        bail!("spatial queries require --sync or --parse-report");
    }

    let config = resolve_bridge_config(&cli)?;
    let bridge = TabletopBridge::from_config(&config)?;
    let result = run_sidecar_command(&cli, &bridge).await;
    bridge.shutdown().await;
    result
}

async fn run_sidecar_command(cli: &Cli, bridge: &TabletopBridge) -> Result<()> {
    let server = cli
        .server
        .as_deref()
        .unwrap_or(bridge.sync_config().server.as_str());

    if cli.list_tools {
        let tools = bridge
            .list_tools(server)
            .await
            .with_context(|| format!("failed to list tools on sidecar '{server}'"))?;
        print!("{}", render_tool_list(server, &tools));
        return Ok(());
    }

    if let Some(tool) = &cli.call_tool {
        let outcome = bridge
            .call(server, tool, cli.tool_args.clone())
            .await
            .with_context(|| format!("failed to call tool '{tool}' on sidecar '{server}'"))?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            println!("{}", outcome.text);
        }
        if outcome.is_error {
            bail!("tool '{tool}' on sidecar '{server}' reported an error");
        }
        return Ok(());
    }

    let report = bridge.sync().await.context("state sync failed")?;
    print!("{}", render_sync_report(&report));
    print_snapshot(cli, &bridge.snapshot())
}

fn run_parse_report(cli: &Cli, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state report {}", path.display()))?;
    let parsed = parse_state_text(&raw);
    let summary = render_parse_summary(&parsed);
    let index = SpatialIndex::default();
    index.replace_parsed(parsed);
    print!("{summary}");
    print_snapshot(cli, &index.snapshot())
}

fn print_snapshot(cli: &Cli, snapshot: &SpatialSnapshot) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot_json(snapshot))?);
    }
    for line in render_spatial_queries(snapshot, &SpatialQueries::from_cli(cli)) {
        println!("{line}");
    }
    Ok(())
}

pub(crate) fn render_tool_list(server: &str, tools: &[ToolDescriptor]) -> String {
    let mut lines = vec![format!("tools: server={server} count={}", tools.len())];
    for tool in tools {
        if tool.description.is_empty() {
            lines.push(format!("  {}", tool.name));
        } else {
            lines.push(format!("  {}: {}", tool.name, tool.description));
        }
    }
    lines.join("\n") + "\n"
}

pub(crate) fn render_sync_report(report: &SyncReport) -> String {
    let mut rendered = format!(
        "sync: revision={} grid={} entities={} terrain={} skipped={}\n",
        report.revision,
        report.grid_extent,
        report.entity_count,
        report.terrain_count,
        report.diagnostics.len()
    );
    rendered.push_str(&render_diagnostics(&report.diagnostics));
    rendered
}

pub(crate) fn render_parse_summary(parsed: &ParsedState) -> String {
    let mut rendered = format!(
        "parse: grid={} entities={} terrain={} skipped={}\n",
        parsed.grid_extent,
        parsed.entities.len(),
        parsed.terrain.len(),
        parsed.diagnostics.len()
    );
    rendered.push_str(&render_diagnostics(&parsed.diagnostics));
    rendered
}

fn render_diagnostics(diagnostics: &[ParseDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(|diagnostic| {
            format!(
                "  skipped line {}: {} ({})\n",
                diagnostic.line_number,
                diagnostic.error,
                diagnostic.line.trim()
            )
        })
        .collect()
}

pub(crate) fn snapshot_json(snapshot: &SpatialSnapshot) -> Value {
    json!({
        "revision": snapshot.revision(),
        "grid_extent": snapshot.frame().grid_extent(),
        "entities": snapshot.entities(),
        "terrain": snapshot.terrain(),
    })
}

pub(crate) fn render_spatial_queries(
    snapshot: &SpatialSnapshot,
    queries: &SpatialQueries,
) -> Vec<String> {
    let ignored = queries
        .ignore_entity_ids
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>();
    let mut lines = Vec::new();
    for tile in &queries.blocked {
        let blocked = snapshot.is_blocked(tile.x, tile.z, &ignored, &[]);
        lines.push(format!(
            "blocked {},{}: {}",
            tile.x,
            tile.z,
            if blocked { "yes" } else { "no" }
        ));
    }
    for tile in &queries.elevation {
        lines.push(format!(
            "elevation {},{}: {}",
            tile.x,
            tile.z,
            snapshot.elevation_at(tile.x, tile.z, &ignored)
        ));
    }
    for tile in &queries.nearest_open {
        let found = snapshot.nearest_open_tile(tile.x, tile.z, queries.max_radius, &ignored);
        lines.push(match found {
            Some(open) => format!("nearest-open {},{}: {},{}", tile.x, tile.z, open.x, open.z),
            None => format!(
                "nearest-open {},{}: none within radius {}",
                tile.x, tile.z, queries.max_radius
            ),
        });
    }
    lines
}
