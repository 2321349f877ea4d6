//! Race-free startup and routing for a set of named sidecar clients.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::{
    future::{join_all, BoxFuture, FutureExt, Shared},
    stream::{FuturesUnordered, StreamExt},
};
use serde_json::Value;

use crate::{
    lock_or_recover, CallOptions, ClientInfo, ClientState, RpcClient, RpcError, ServerRegistry,
    ToolCallOutcome, ToolDescriptor,
};

type StartupFuture = Shared<BoxFuture<'static, Result<(), RpcError>>>;

/// Owns every configured sidecar client.
///
/// Construct one per application (or per test) and pass it to callers; cloning
/// shares the same clients.
#[derive(Clone)]
pub struct RpcManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    clients: BTreeMap<String, RpcClient>,
    client_info: ClientInfo,
    startup: Mutex<Option<StartupFuture>>,
    startup_runs: AtomicU64,
    started_once: AtomicBool,
}

impl std::fmt::Debug for RpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcManager")
            .field("clients", &self.inner.clients)
            .field("client_info", &self.inner.client_info)
            .finish()
    }
}

impl RpcManager {
    pub fn new(
        registry: &ServerRegistry,
        client_info: ClientInfo,
        default_timeout: Duration,
    ) -> Result<Self, RpcError> {
        if registry.is_empty() {
            return Err(RpcError::Config {
                detail: "at least one sidecar server must be registered".to_string(),
            });
        }
        let clients = registry
            .server_names()
            .map(|name| {
                registry
                    .resolve(name)
                    .map(|launch| (name.to_string(), RpcClient::new(launch, default_timeout)))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                clients,
                client_info,
                startup: Mutex::new(None),
                startup_runs: AtomicU64::new(0),
                started_once: AtomicBool::new(false),
            }),
        })
    }

    pub fn client(&self, server: &str) -> Option<RpcClient> {
        self.inner.clients.get(server).cloned()
    }

    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.inner.clients.keys().map(String::as_str)
    }

    /// True when every client has completed its handshake on a live process.
    pub fn is_started(&self) -> bool {
        self.inner
            .clients
            .values()
            .all(|client| client.state() == ClientState::Initialized)
    }

    /// Number of startup sequences actually executed (not joined).
    pub fn startup_runs(&self) -> u64 {
        self.inner.startup_runs.load(Ordering::SeqCst)
    }

    /// Starts and initializes every client exactly once across concurrent callers.
    ///
    /// Callers arriving while a startup is in flight await that same startup
    /// and observe its outcome. A failed startup closes the clients that were
    /// not already initialized when it began and clears the in-flight slot so
    /// the next call retries. The first error to complete is returned.
    pub async fn ensure_started(&self) -> Result<(), RpcError> {
        if self.is_started() {
            return Ok(());
        }
        let startup = {
            let mut slot = lock_or_recover(&self.inner.startup);
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    self.inner.startup_runs.fetch_add(1, Ordering::SeqCst);
                    let clients = self.inner.clients.values().cloned().collect::<Vec<_>>();
                    let startup = start_clients(clients, self.inner.client_info.clone())
                        .boxed()
                        .shared();
                    *slot = Some(startup.clone());
                    startup
                }
            }
        };

        let outcome = startup.clone().await;
        let mut slot = lock_or_recover(&self.inner.startup);
        if slot
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&startup))
        {
            *slot = None;
        }
        if outcome.is_ok() {
            self.inner.started_once.store(true, Ordering::SeqCst);
        }
        outcome
    }

    pub async fn call(
        &self,
        server: &str,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        let client = self.ready_client(server).await?;
        client.call(method, params, options).await
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        options: CallOptions,
    ) -> Result<ToolCallOutcome, RpcError> {
        let client = self.ready_client(server).await?;
        client.call_tool(tool, arguments, options).await
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, RpcError> {
        let client = self.ready_client(server).await?;
        client.list_tools().await
    }

    /// Closes every client; a later `ensure_started` spawns fresh processes.
    pub async fn shutdown(&self) {
        join_all(self.inner.clients.values().map(RpcClient::close)).await;
    }

    /// Resolves `server` and makes it ready. Until the first startup succeeds
    /// every client is started together; afterwards only the target client is
    /// reconnected, so one broken sidecar cannot fail calls to the others.
    async fn ready_client(&self, server: &str) -> Result<RpcClient, RpcError> {
        let client = self.require_client(server)?;
        if self.inner.started_once.load(Ordering::SeqCst) {
            client.initialize(&self.inner.client_info).await?;
        } else {
            self.ensure_started().await?;
        }
        Ok(client)
    }

    fn require_client(&self, server: &str) -> Result<RpcClient, RpcError> {
        self.client(server).ok_or_else(|| RpcError::UnknownServer {
            server: server.to_string(),
        })
    }
}

async fn start_clients(clients: Vec<RpcClient>, client_info: ClientInfo) -> Result<(), RpcError> {
    let ready_before = clients
        .iter()
        .map(|client| client.state() == ClientState::Initialized)
        .collect::<Vec<_>>();
    let mut pending = clients
        .iter()
        .map(|client| client.initialize(&client_info))
        .collect::<FuturesUnordered<_>>();
    let mut first_error = None;
    while let Some(result) = pending.next().await {
        if let Err(error) = result {
            first_error.get_or_insert(error);
        }
    }
    drop(pending);

    let Some(error) = first_error else {
        tracing::debug!(clients = clients.len(), "sidecar startup complete");
        return Ok(());
    };
    tracing::warn!(error = %error, reason_code = error.reason_code(), "sidecar startup failed");
    // Clients that were serving before this run keep their processes.
    let started_here = clients
        .iter()
        .zip(ready_before)
        .filter(|(_, ready)| !ready)
        .map(|(client, _)| client.close());
    join_all(started_here).await;
    Err(error)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        test_support::{write_executable_script, MOCK_SIDECAR_SCRIPT},
        SidecarServerConfig,
    };

    fn sidecar_config(temp: &TempDir, name: &str) -> SidecarServerConfig {
        let script = temp.path().join(format!("{name}.sh"));
        write_executable_script(&script, MOCK_SIDECAR_SCRIPT);
        let mut config =
            SidecarServerConfig::new(name).with_command(script.display().to_string());
        config.env.insert(
            "SPAWN_LOG".to_string(),
            temp.path()
                .join(format!("{name}.spawns"))
                .display()
                .to_string(),
        );
        config
            .env
            .insert("STARTUP_DELAY".to_string(), "0.2".to_string());
        config
    }

    fn spawn_log_lines(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .map(|raw| raw.lines().count())
            .unwrap_or(0)
    }

    fn manager_for(temp: &TempDir, configs: Vec<SidecarServerConfig>) -> RpcManager {
        let registry =
            ServerRegistry::from_configs(temp.path(), configs).expect("registry");
        RpcManager::new(&registry, ClientInfo::default(), Duration::from_secs(5))
            .expect("manager")
    }

    #[tokio::test]
    async fn functional_concurrent_ensure_started_spawns_each_client_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager_for(
            &temp,
            vec![sidecar_config(&temp, "game-state"), sidecar_config(&temp, "rules")],
        );

        let outcomes = join_all((0..8).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_started().await })
        }))
        .await;
        for outcome in outcomes {
            outcome.expect("join").expect("started");
        }

        assert!(manager.is_started());
        assert_eq!(manager.startup_runs(), 1);
        for name in ["game-state", "rules"] {
            let client = manager.client(name).expect("client");
            assert_eq!(client.spawn_count(), 1);
            assert_eq!(client.state(), ClientState::Initialized);
            assert_eq!(
                spawn_log_lines(&temp.path().join(format!("{name}.spawns"))),
                1
            );
        }

        manager.ensure_started().await.expect("fast path");
        assert_eq!(manager.startup_runs(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn regression_failed_startup_is_shared_and_retryable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("rules-late.sh");
        let manager = manager_for(
            &temp,
            vec![
                sidecar_config(&temp, "game-state"),
                SidecarServerConfig::new("rules").with_command(missing.display().to_string()),
            ],
        );

        let outcomes = join_all((0..4).map(|_| manager.ensure_started())).await;
        let errors = outcomes
            .into_iter()
            .map(|outcome| outcome.expect_err("startup fails"))
            .collect::<Vec<_>>();
        assert!(errors
            .iter()
            .all(|error| error == &errors[0] && error.reason_code() == "sidecar_spawn_failed"));
        assert_eq!(manager.startup_runs(), 1);
        assert_eq!(
            manager.client("game-state").expect("client").state(),
            ClientState::Disconnected
        );

        write_executable_script(&missing, MOCK_SIDECAR_SCRIPT);
        manager.ensure_started().await.expect("retry succeeds");
        assert_eq!(manager.startup_runs(), 2);
        assert!(manager.is_started());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn regression_failed_restart_leaves_healthy_clients_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager_for(
            &temp,
            vec![sidecar_config(&temp, "game-state"), sidecar_config(&temp, "rules")],
        );
        manager.ensure_started().await.expect("started");

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .call_tool("game-state", "slow", json!({}), CallOptions::default())
                    .await
            })
        };
        let crash = manager
            .call_tool("rules", "crash", json!({}), CallOptions::default())
            .await
            .expect_err("rules exits");
        assert!(matches!(crash, RpcError::ConnectionLost { .. }));
        std::fs::remove_file(temp.path().join("rules.sh")).expect("remove rules script");

        let outcome = manager
            .call_tool(
                "game-state",
                "get_combat_state",
                json!({}),
                CallOptions::default(),
            )
            .await
            .expect("healthy sidecar still answers");
        assert!(outcome.text.contains("TERRAIN"));
        let slow = slow.await.expect("join").expect("in-flight call survives");
        assert_eq!(slow.text, "slow");

        let error = manager
            .call_tool("rules", "roll", json!({}), CallOptions::default())
            .await
            .expect_err("rules cannot restart");
        assert_eq!(error.reason_code(), "sidecar_spawn_failed");
        manager
            .ensure_started()
            .await
            .expect_err("full startup still reports rules");

        let game_state = manager.client("game-state").expect("client");
        assert_eq!(game_state.state(), ClientState::Initialized);
        assert_eq!(game_state.spawn_count(), 1);
        assert_eq!(
            manager.client("rules").expect("client").state(),
            ClientState::Disconnected
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn regression_startup_reports_first_failure_to_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exits_late = temp.path().join("alpha.sh");
        write_executable_script(&exits_late, "#!/bin/sh\nsleep 0.3\nexit 3\n");
        let manager = manager_for(
            &temp,
            vec![
                SidecarServerConfig::new("alpha").with_command(exits_late.display().to_string()),
                SidecarServerConfig::new("zulu")
                    .with_command(temp.path().join("zulu.sh").display().to_string()),
            ],
        );

        let error = manager.ensure_started().await.expect_err("startup fails");
        assert!(
            matches!(&error, RpcError::Spawn { server, .. } if server == "zulu"),
            "unexpected error: {error:?}"
        );
        for name in ["alpha", "zulu"] {
            assert_eq!(
                manager.client(name).expect("client").state(),
                ClientState::Disconnected
            );
        }
    }

    #[tokio::test]
    async fn unit_unknown_server_is_rejected_without_starting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager_for(&temp, vec![sidecar_config(&temp, "game-state")]);
        let error = manager
            .call_tool("narrator", "roll", json!({}), CallOptions::default())
            .await
            .expect_err("unknown server");
        assert!(matches!(error, RpcError::UnknownServer { .. }));
        assert_eq!(manager.startup_runs(), 0);
    }

    #[tokio::test]
    async fn functional_named_clients_do_not_block_each_other() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager_for(
            &temp,
            vec![sidecar_config(&temp, "game-state"), sidecar_config(&temp, "rules")],
        );
        manager.ensure_started().await.expect("started");

        let hung = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .call_tool(
                        "rules",
                        "hang",
                        json!({}),
                        CallOptions::default().with_timeout(Duration::from_secs(2)),
                    )
                    .await
            })
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            manager.call_tool(
                "game-state",
                "get_combat_state",
                json!({}),
                CallOptions::default(),
            ),
        )
        .await
        .expect("independent call completes")
        .expect("call");
        assert!(outcome.text.contains("TERRAIN"));

        manager.shutdown().await;
        let error = hung.await.expect("join").expect_err("closed");
        assert!(matches!(error, RpcError::Closed { .. }));
    }

    #[test]
    fn unit_manager_requires_registered_servers() {
        let error = RpcManager::new(
            &ServerRegistry::new("bin"),
            ClientInfo::default(),
            Duration::from_secs(1),
        )
        .expect_err("empty registry");
        assert_eq!(error.reason_code(), "sidecar_invalid_config");
    }
}
