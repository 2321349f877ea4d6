//! Collaborator-facing bridge between tabletop sidecar RPC and the spatial index.
//!
//! Loads the JSON bridge config, builds the sidecar manager, and runs state
//! sync cycles that fetch, parse, and atomically publish the combat snapshot.

pub mod bridge_config;
pub mod bridge_error;
pub mod bridge_runtime;

pub use bridge_config::*;
pub use bridge_error::*;
pub use bridge_runtime::*;
