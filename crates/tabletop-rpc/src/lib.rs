//! JSON-RPC 2.0 over stdio for tabletop sidecar processes.
//!
//! Exposes the line-delimited process transport, the per-server request
//! correlating client, the multi-server manager with single-flight startup,
//! and the MCP-style tool catalog helpers those layers share.

pub mod cancellation;
pub mod rpc_client;
pub mod rpc_error;
pub mod rpc_manager;
pub mod rpc_protocol;
pub mod rpc_transport;
pub mod server_registry;
pub mod tool_catalog;

pub use cancellation::*;
pub use rpc_client::*;
pub use rpc_error::*;
pub use rpc_manager::*;
pub use rpc_protocol::*;
pub use rpc_transport::*;
pub use server_registry::*;
pub use tool_catalog::*;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
