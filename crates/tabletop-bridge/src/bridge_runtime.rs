//! Collaborator-facing facade: tool calls, state sync, and spatial queries.

use std::sync::Arc;

use serde_json::Value;
use tabletop_rpc::{CallOptions, RpcManager, ToolCallOutcome, ToolDescriptor};
use tabletop_spatial::{
    parse_state_text, LocalTile, ParseDiagnostic, SpatialIndex, SpatialSnapshot,
};
use tokio::sync::Mutex;

use crate::{BridgeConfigFile, BridgeError, SyncConfig};

/// Outcome of one fetch, parse, and replace cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub revision: u64,
    pub grid_extent: u32,
    pub entity_count: usize,
    pub terrain_count: usize,
    pub diagnostics: Vec<ParseDiagnostic>,
}

/// Cheap to clone; clones share the manager, index, and sync lock.
#[derive(Debug, Clone)]
pub struct TabletopBridge {
    manager: RpcManager,
    index: Arc<SpatialIndex>,
    sync: SyncConfig,
    sync_cycle: Arc<Mutex<()>>,
}

impl TabletopBridge {
    pub fn new(manager: RpcManager, sync: SyncConfig) -> Self {
        Self {
            manager,
            index: Arc::new(SpatialIndex::default()),
            sync,
            sync_cycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(config: &BridgeConfigFile) -> anyhow::Result<Self> {
        let registry = config.registry()?;
        let manager = RpcManager::new(
            &registry,
            config.client_info.clone(),
            config.request_timeout(),
        )?;
        Ok(Self::new(manager, config.sync.clone()))
    }

    pub fn manager(&self) -> &RpcManager {
        &self.manager
    }

    pub fn index(&self) -> &Arc<SpatialIndex> {
        &self.index
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync
    }

    pub fn snapshot(&self) -> Arc<SpatialSnapshot> {
        self.index.snapshot()
    }

    pub async fn ensure_started(&self) -> Result<(), BridgeError> {
        Ok(self.manager.ensure_started().await?)
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, BridgeError> {
        Ok(self.manager.list_tools(server).await?)
    }

    /// Invokes a tool. A tool-reported error is returned as an outcome with
    /// `is_error` set, not as a failure.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, BridgeError> {
        self.call_with_options(server, tool, arguments, CallOptions::default())
            .await
    }

    pub async fn call_with_options(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        options: CallOptions,
    ) -> Result<ToolCallOutcome, BridgeError> {
        Ok(self
            .manager
            .call_tool(server, tool, arguments, options)
            .await?)
    }

    /// Raw JSON-RPC request for methods outside the tool surface.
    pub async fn request(
        &self,
        server: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        Ok(self
            .manager
            .call(server, method, params, CallOptions::default())
            .await?)
    }

    pub async fn sync(&self) -> Result<SyncReport, BridgeError> {
        self.sync_with_options(CallOptions::default()).await
    }

    /// Fetches the state report, parses it, and swaps the index snapshot.
    ///
    /// Cycles are serialized so an older report never replaces a newer one.
    /// Any failure leaves the previous snapshot in place.
    pub async fn sync_with_options(&self, options: CallOptions) -> Result<SyncReport, BridgeError> {
        let _cycle = self.sync_cycle.lock().await;
        let SyncConfig {
            server,
            tool,
            arguments,
        } = &self.sync;
        let outcome = self
            .manager
            .call_tool(server, tool, arguments.clone(), options)
            .await
            .inspect_err(|error| {
                tracing::warn!(
                    server = %server,
                    tool = %tool,
                    reason_code = error.reason_code(),
                    error = %error,
                    "state sync call failed"
                )
            })?;
        if outcome.is_error {
            return Err(BridgeError::ToolReportedError {
                server: server.clone(),
                tool: tool.clone(),
                message: outcome.text,
            });
        }
        if outcome.text.trim().is_empty() {
            return Err(BridgeError::EmptyReport {
                server: server.clone(),
                tool: tool.clone(),
            });
        }

        let parsed = parse_state_text(&outcome.text);
        let grid_extent = parsed.grid_extent;
        let entity_count = parsed.entities.len();
        let terrain_count = parsed.terrain.len();
        let diagnostics = parsed.diagnostics.clone();
        let revision = self.index.replace_parsed(parsed);
        if !diagnostics.is_empty() {
            tracing::warn!(
                server = %server,
                skipped = diagnostics.len(),
                revision,
                "state report contained malformed records"
            );
        }
        tracing::debug!(
            server = %server,
            revision,
            entities = entity_count,
            terrain = terrain_count,
            "state sync complete"
        );
        Ok(SyncReport {
            revision,
            grid_extent,
            entity_count,
            terrain_count,
            diagnostics,
        })
    }

    pub fn is_blocked(
        &self,
        x: i32,
        z: i32,
        ignore_entity_ids: &[&str],
        ignore_terrain_ids: &[&str],
    ) -> bool {
        self.index
            .is_blocked(x, z, ignore_entity_ids, ignore_terrain_ids)
    }

    pub fn elevation_at(&self, x: i32, z: i32, ignore_entity_ids: &[&str]) -> f64 {
        self.index.elevation_at(x, z, ignore_entity_ids)
    }

    pub fn nearest_open_tile(
        &self,
        start_x: i32,
        start_z: i32,
        max_radius: u32,
        ignore_entity_ids: &[&str],
    ) -> Option<LocalTile> {
        self.index
            .nearest_open_tile(start_x, start_z, max_radius, ignore_entity_ids)
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
