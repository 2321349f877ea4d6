use std::{
    path::Path,
    sync::Mutex,
    time::Duration,
};

use serde_json::Value;
use tokio::sync::Notify;

use crate::{lock_or_recover, TransportDiagnostic, TransportHandler};

/// Mock sidecar speaking newline-delimited JSON-RPC.
///
/// `tools/call` behaviour is selected by tool name: `get_combat_state`
/// answers with a state report, `slow` answers after 300ms in the background,
/// `hang` never answers, `crash` exits with status 7, `noisy` emits garbage and
/// an unmatched response before answering. `$SPAWN_LOG`, when set, receives one
/// line per process start.
pub(crate) const MOCK_SIDECAR_SCRIPT: &str = r#"#!/bin/sh
if [ -n "${SPAWN_LOG:-}" ]; then
  echo "spawned $$" >> "$SPAWN_LOG"
fi
if [ -n "${STARTUP_DELAY:-}" ]; then
  sleep "$STARTUP_DELAY"
fi
while IFS= read -r line; do
  if [ -z "$line" ]; then
    continue
  fi
  method=$(printf '%s' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -z "$id" ]; then
    continue
  fi
  case "$method" in
    initialize)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock-sidecar","version":"1.0.0"}}}'
      ;;
    tools/list)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"tools":[{"name":"get_combat_state","description":"combat snapshot"},{"name":"slow"}]}}'
      ;;
    tools/call)
      tool=$(printf '%s' "$line" | sed -n 's/.*"name":"\([^"]*\)".*/\1/p')
      case "$tool" in
        get_combat_state)
          printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"content":[{"type":"text","text":"Grid: 40x40\nTERRAIN:\n- Wall at (5,3) - 5x5x25ft [blocks movement]\nCOMBATANTS:\n- Aria at (20,20,0) medium creature"}]}}'
          ;;
        slow)
          ( sleep 0.3; printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"content":[{"type":"text","text":"slow"}]}}' ) &
          ;;
        hang)
          ;;
        crash)
          exit 7
          ;;
        noisy)
          printf 'this is not json\n'
          printf '%s\n' '{"jsonrpc":"2.0","id":999999,"result":{"stray":true}}'
          printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"content":[{"type":"text","text":"noisy"}]}}'
          ;;
        *)
          printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"isError":true,"content":[{"type":"text","text":"unknown tool"}]}}'
          ;;
      esac
      ;;
    *)
      printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"error":{"code":-32601,"message":"method not found"}}'
      ;;
  esac
done
"#;

pub(crate) fn write_executable_script(path: &Path, body: &str) {
    std::fs::write(path, body).expect("write mock script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).expect("chmod");
    }
}

/// Transport handler that records every callback for assertions.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    lines: Mutex<Vec<Value>>,
    exits: Mutex<Vec<Option<i32>>>,
    diagnostics: Mutex<Vec<TransportDiagnostic>>,
    changed: Notify,
}

impl RecordingHandler {
    pub(crate) fn lines(&self) -> Vec<Value> {
        lock_or_recover(&self.lines).clone()
    }

    pub(crate) fn exit_codes(&self) -> Vec<Option<i32>> {
        lock_or_recover(&self.exits).clone()
    }

    pub(crate) fn exit_count(&self) -> usize {
        lock_or_recover(&self.exits).len()
    }

    pub(crate) fn diagnostics(&self) -> Vec<TransportDiagnostic> {
        lock_or_recover(&self.diagnostics).clone()
    }

    pub(crate) async fn wait_for_lines(&self, count: usize) {
        self.wait_until(|handler| lock_or_recover(&handler.lines).len() >= count)
            .await;
    }

    pub(crate) async fn wait_for_exit(&self) {
        self.wait_until(|handler| handler.exit_count() > 0).await;
    }

    pub(crate) async fn wait_until(&self, condition: impl Fn(&Self) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if condition(self) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("condition reached before timeout");
    }
}

impl TransportHandler for RecordingHandler {
    fn on_line(&self, frame: Value) {
        lock_or_recover(&self.lines).push(frame);
        self.changed.notify_waiters();
    }

    fn on_exit(&self, exit_code: Option<i32>) {
        lock_or_recover(&self.exits).push(exit_code);
        self.changed.notify_waiters();
    }

    fn on_diagnostic(&self, diagnostic: TransportDiagnostic) {
        lock_or_recover(&self.diagnostics).push(diagnostic);
        self.changed.notify_waiters();
    }
}
