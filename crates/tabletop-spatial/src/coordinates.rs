use serde::{Deserialize, Serialize};

pub const DEFAULT_GRID_EXTENT: u32 = 100;

/// Tile in the local (origin-centered) grid. `z` is the second horizontal axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalTile {
    pub x: i32,
    pub z: i32,
}

impl LocalTile {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Tile as reported by the worker: non-negative on a `grid_extent` square grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTile {
    pub x: i32,
    pub y: i32,
}

impl RemoteTile {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Fixed offset between remote and local grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateFrame {
    grid_extent: u32,
    origin: i32,
}

impl Default for CoordinateFrame {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_EXTENT)
    }
}

impl CoordinateFrame {
    /// `grid_extent` is clamped into `1..=i32::MAX`.
    pub fn new(grid_extent: u32) -> Self {
        let grid_extent = grid_extent.clamp(1, i32::MAX as u32);
        Self {
            grid_extent,
            origin: (grid_extent / 2) as i32,
        }
    }

    pub fn grid_extent(&self) -> u32 {
        self.grid_extent
    }

    pub fn origin(&self) -> i32 {
        self.origin
    }

    pub fn to_local(&self, remote: RemoteTile) -> LocalTile {
        LocalTile {
            x: remote.x.wrapping_sub(self.origin),
            z: remote.y.wrapping_sub(self.origin),
        }
    }

    pub fn to_remote(&self, local: LocalTile) -> RemoteTile {
        RemoteTile {
            x: local.x.wrapping_add(self.origin),
            y: local.z.wrapping_add(self.origin),
        }
    }

    pub fn contains_remote(&self, remote: RemoteTile) -> bool {
        let extent = i64::from(self.grid_extent);
        (0..extent).contains(&i64::from(remote.x)) && (0..extent).contains(&i64::from(remote.y))
    }

    /// True when the local tile maps onto the bounded remote grid.
    pub fn contains(&self, local: LocalTile) -> bool {
        let min = -i64::from(self.origin);
        let max = min + i64::from(self.grid_extent);
        (min..max).contains(&i64::from(local.x)) && (min..max).contains(&i64::from(local.z))
    }
}
