#![cfg(unix)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::json;
use tabletop_bridge::{load_bridge_config_file, BridgeError, TabletopBridge};
use tabletop_rpc::{CallOptions, CancellationToken, ClientState, RpcError};
use tabletop_spatial::{EntityKind, LocalTile};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Game-state sidecar: each `tools/call` returns the next report in
/// `$REPORT_DIR/report-<n>.txt`, repeating the last one once exhausted.
const GAME_STATE_SCRIPT: &str = r#"#!/bin/sh
calls=0
while IFS= read -r line; do
  method=$(printf '%s' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -z "$id" ]; then
    continue
  fi
  case "$method" in
    initialize)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"game-state","version":"1.0.0"}}}'
      ;;
    tools/call)
      calls=$((calls + 1))
      report="$REPORT_DIR/report-$calls.txt"
      if [ ! -f "$report" ]; then
        report=$(ls "$REPORT_DIR"/report-*.txt | sort | tail -n 1)
      fi
      text=$(awk '{ printf "%s\\n", $0 }' "$report")
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"content":[{"type":"text","text":"'"$text"'"}]}}'
      ;;
    *)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"error":{"code":-32601,"message":"method not found"}}'
      ;;
  esac
done
"#;

/// Rules sidecar: `roll` answers with structured content, `stall` never replies.
const RULES_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  method=$(printf '%s' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -z "$id" ]; then
    continue
  fi
  case "$method" in
    initialize)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"rules","version":"1.0.0"}}}'
      ;;
    tools/list)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"tools":[{"name":"roll","description":"Roll dice"},{"name":"stall"}]}}'
      ;;
    tools/call)
      case "$line" in
        *'"name":"stall"'*)
          ;;
        *)
          printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"content":[{"type":"text","text":"rolled 17"}],"structuredContent":{"total":17}}}'
          ;;
      esac
      ;;
    *)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"error":{"code":-32601,"message":"method not found"}}'
      ;;
  esac
done
"#;

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "tabletop-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).expect("script should be written");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn bridge_in(workspace: &IsolatedWorkspace, reports: &[&str]) -> TabletopBridge {
    let root = workspace.root();
    let bin_dir = root.join("sidecars");
    let report_dir = root.join("reports");
    fs::create_dir_all(&bin_dir).expect("bin dir");
    fs::create_dir_all(&report_dir).expect("report dir");
    write_executable(&bin_dir.join("game-state"), GAME_STATE_SCRIPT);
    write_executable(&bin_dir.join("rules"), RULES_SCRIPT);
    for (index, report) in reports.iter().enumerate() {
        fs::write(report_dir.join(format!("report-{}.txt", index + 1)), report)
            .expect("report should be written");
    }

    let config = json!({
        "schema_version": 1,
        "binaries_dir": "sidecars",
        "servers": [
            {"name": "game-state", "env": {"REPORT_DIR": report_dir.display().to_string()}},
            {"name": "rules"}
        ],
        "client_info": {"name": "tabletop-integration", "version": "0.1.0"},
        "request_timeout_ms": 5000,
        "sync": {"server": "game-state", "tool": "get_combat_state"}
    });
    let config_path = root.join("tabletop-bridge.json");
    fs::write(&config_path, config.to_string()).expect("config should be written");
    let config = load_bridge_config_file(&config_path).expect("config should load");
    TabletopBridge::from_config(&config).expect("bridge should build")
}

const OPENING_REPORT: &str = "Map size: 20x20\n\
TERRAIN:\n\
- Pillar at (12,10) - 5x5x15ft [blocks movement, blocks line of sight]\n\
- Stone wall at (8,8) - 15x5x10ft [blocks movement]\n\
COMBATANTS:\n\
- Brannoc at (10,10,0) medium creature, HP 30/30, AC 17\n\
- Ogre at (14,14) large hostile creature, HP 59/59\n";

const SECOND_ROUND_REPORT: &str = "Map size: 20x20\n\
TERRAIN:\n\
- Pillar at (12,10) - 5x5x15ft [blocks movement]\n\
COMBATANTS:\n\
- Brannoc at (11,10,0) medium creature, HP 21/30\n\
- Ogre at (12,12) large hostile creature, HP 40/59, conditions: prone\n";

#[tokio::test]
async fn integration_sync_then_queries_follow_each_report() {
    let workspace = IsolatedWorkspace::new("sync-roundtrip");
    let bridge = bridge_in(&workspace, &[OPENING_REPORT, SECOND_ROUND_REPORT]);

    let first = bridge.sync().await.expect("first sync");
    assert_eq!(first.revision, 1);
    assert_eq!(first.grid_extent, 20);
    assert_eq!((first.entity_count, first.terrain_count), (2, 2));
    assert!(first.diagnostics.is_empty());

    // Origin is 10, so remote (x, y) maps to local (x - 10, y - 10).
    assert!(bridge.is_blocked(2, 0, &[], &[]), "pillar");
    assert!(bridge.is_blocked(-2, -2, &[], &[]), "wall start");
    assert!(bridge.is_blocked(0, -2, &[], &[]), "wall spans three tiles");
    assert!(!bridge.is_blocked(1, -2, &[], &[]));
    assert!(bridge.is_blocked(5, 5, &[], &[]), "large ogre footprint");
    assert_eq!(bridge.elevation_at(2, 0, &[]), 3.0);
    assert_eq!(bridge.elevation_at(4, 4, &[]), 2.0);

    let snapshot = bridge.snapshot();
    let brannoc = snapshot.entity("brannoc").expect("brannoc");
    assert!(brannoc.primary);
    assert_eq!(brannoc.kind, EntityKind::Ally);
    assert_eq!(brannoc.attributes.armor_class, Some(17));
    assert_eq!(
        snapshot.entity("ogre").map(|ogre| (ogre.kind, ogre.size_units)),
        Some((EntityKind::Hostile, 2))
    );

    let second = bridge.sync().await.expect("second sync");
    assert_eq!(second.revision, 2);
    assert_eq!(second.terrain_count, 1);
    assert!(!bridge.is_blocked(-2, -2, &[], &[]), "wall removed");
    assert!(bridge.is_blocked(1, 0, &[], &[]), "brannoc moved east");
    assert!(!bridge.is_blocked(0, 0, &[], &[]));
    assert_eq!(
        bridge
            .snapshot()
            .entity("ogre")
            .map(|ogre| ogre.attributes.conditions.clone()),
        Some(vec!["prone".to_string()])
    );
    assert_eq!(
        bridge.nearest_open_tile(2, 2, 2, &[]),
        Some(LocalTile::new(1, 1))
    );

    assert_eq!(snapshot.revision(), 1, "held snapshot is unchanged");
    bridge.shutdown().await;
}

#[tokio::test]
async fn integration_rules_sidecar_calls_are_independent_of_sync() {
    let workspace = IsolatedWorkspace::new("rules-calls");
    let bridge = bridge_in(&workspace, &[OPENING_REPORT]);

    let tools = bridge.list_tools("rules").await.expect("rules tools");
    assert_eq!(
        tools.iter().map(|tool| tool.name.as_str()).collect::<Vec<_>>(),
        vec!["roll", "stall"]
    );

    let rolled = bridge
        .call("rules", "roll", json!({"dice": "1d20"}))
        .await
        .expect("roll");
    assert!(!rolled.is_error);
    assert_eq!(rolled.text, "rolled 17");
    assert_eq!(rolled.payload, json!({"total": 17}));
    assert_eq!(bridge.index().revision(), 0);

    let token = CancellationToken::new();
    let stalled = {
        let bridge = bridge.clone();
        let token = token.clone();
        tokio::spawn(async move {
            bridge
                .call_with_options(
                    "rules",
                    "stall",
                    json!({}),
                    CallOptions::default().with_cancellation(token),
                )
                .await
        })
    };
    let report = bridge.sync().await.expect("sync while rules call is pending");
    assert_eq!(report.revision, 1);
    token.cancel();
    let error = stalled
        .await
        .expect("join")
        .expect_err("stalled call is cancelled");
    assert!(matches!(error, BridgeError::Rpc(RpcError::Cancelled { .. })));

    bridge.shutdown().await;
    let manager = bridge.manager();
    for name in ["game-state", "rules"] {
        assert_eq!(
            manager.client(name).expect("client").state(),
            ClientState::Disconnected
        );
    }
}
