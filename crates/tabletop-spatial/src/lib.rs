//! Spatial model for tabletop combat state.
//!
//! Parses the worker's text state report into typed entities and terrain,
//! converts remote grid coordinates into a centered local frame, and serves
//! occupancy, elevation, and nearest-open-tile queries from an atomically
//! swapped snapshot.

pub mod coordinates;
pub mod spatial_index;
pub mod spatial_types;
pub mod state_text_parser;

pub use coordinates::*;
pub use spatial_index::*;
pub use spatial_types::*;
pub use state_text_parser::*;
