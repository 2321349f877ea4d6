//! Snapshot-swapped occupancy index over parsed entities and terrain.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{CoordinateFrame, LocalTile, ParsedState, SpatialEntity, TerrainFeature};

/// Immutable view of the battlefield; queries never observe a partial update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialSnapshot {
    revision: u64,
    frame: CoordinateFrame,
    entities: Vec<SpatialEntity>,
    terrain: Vec<TerrainFeature>,
}

impl SpatialSnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn frame(&self) -> CoordinateFrame {
        self.frame
    }

    pub fn entities(&self) -> &[SpatialEntity] {
        &self.entities
    }

    pub fn terrain(&self) -> &[TerrainFeature] {
        &self.terrain
    }

    pub fn entity(&self, id: &str) -> Option<&SpatialEntity> {
        self.entities.iter().find(|entity| entity.id == id)
    }

    pub fn entities_at(&self, x: i32, z: i32) -> impl Iterator<Item = &SpatialEntity> {
        self.entities
            .iter()
            .filter(move |entity| entity.footprint().contains(x, z))
    }

    pub fn is_blocked(
        &self,
        x: i32,
        z: i32,
        ignore_entity_ids: &[&str],
        ignore_terrain_ids: &[&str],
    ) -> bool {
        let terrain_blocks = self.terrain.iter().any(|feature| {
            feature.blocks_movement
                && !ignore_terrain_ids.contains(&feature.id.as_str())
                && feature.footprint().contains(x, z)
        });
        terrain_blocks
            || self.entities.iter().any(|entity| {
                !ignore_entity_ids.contains(&entity.id.as_str())
                    && entity.footprint().contains(x, z)
            })
    }

    /// Highest top surface covering the tile, or 0 on open ground.
    pub fn elevation_at(&self, x: i32, z: i32, ignore_entity_ids: &[&str]) -> f64 {
        let terrain_tops = self
            .terrain
            .iter()
            .filter(|feature| feature.footprint().contains(x, z))
            .map(TerrainFeature::top);
        let entity_tops = self
            .entities
            .iter()
            .filter(|entity| {
                !ignore_entity_ids.contains(&entity.id.as_str())
                    && entity.footprint().contains(x, z)
            })
            .map(SpatialEntity::top);
        terrain_tops.chain(entity_tops).fold(0.0, f64::max)
    }

    /// Closest in-bounds unblocked tile by Chebyshev ring, scanning each ring
    /// top row, bottom row, left column, then right column.
    pub fn nearest_open_tile(
        &self,
        start_x: i32,
        start_z: i32,
        max_radius: u32,
        ignore_entity_ids: &[&str],
    ) -> Option<LocalTile> {
        let start = LocalTile::new(start_x, start_z);
        if self.is_open(start, ignore_entity_ids) {
            return Some(start);
        }
        let bounds = self.grid_bounds();
        let (near, far) = ring_span(start, bounds);
        (near.max(1)..=far.min(i64::from(max_radius))).find_map(|radius| {
            ring_tiles(start, radius, bounds).find(|tile| self.is_open(*tile, ignore_entity_ids))
        })
    }

    /// Inclusive local bounds shared by both axes.
    fn grid_bounds(&self) -> (i64, i64) {
        let min = -i64::from(self.frame.origin());
        (min, min + i64::from(self.frame.grid_extent()) - 1)
    }

    fn is_open(&self, tile: LocalTile, ignore_entity_ids: &[&str]) -> bool {
        self.frame.contains(tile) && !self.is_blocked(tile.x, tile.z, ignore_entity_ids, &[])
    }
}

/// Chebyshev distances from `start` to the nearest and farthest in-grid tiles.
/// Rings outside that span hold no candidates.
fn ring_span(start: LocalTile, (min, max): (i64, i64)) -> (i64, i64) {
    let (x, z) = (i64::from(start.x), i64::from(start.z));
    let near = 0_i64.max(min - x).max(x - max).max(min - z).max(z - max);
    let far = [x - min, max - x, z - min, max - z]
        .into_iter()
        .map(i64::abs)
        .fold(0, i64::max);
    (near, far)
}

/// In-grid tiles at exactly `radius` from `center`. Rows run left to right
/// along x at the lowest (top) and highest (bottom) z; columns run top to bottom.
fn ring_tiles(
    center: LocalTile,
    radius: i64,
    (min, max): (i64, i64),
) -> impl Iterator<Item = LocalTile> {
    let (cx, cz) = (i64::from(center.x), i64::from(center.z));
    let in_grid = move |value: i64| (min..=max).contains(&value);
    let row = move |z: i64| {
        let xs = if in_grid(z) {
            (cx - radius).max(min)..=(cx + radius).min(max)
        } else {
            1..=0
        };
        xs.map(move |x| (x, z))
    };
    let column = move |x: i64| {
        let zs = if in_grid(x) {
            (cz - radius + 1).max(min)..=(cz + radius - 1).min(max)
        } else {
            1..=0
        };
        zs.map(move |z| (x, z))
    };
    row(cz - radius)
        .chain(row(cz + radius))
        .chain(column(cx - radius))
        .chain(column(cx + radius))
        .filter_map(|(x, z)| Some(LocalTile::new(i32::try_from(x).ok()?, i32::try_from(z).ok()?)))
}

/// Shared spatial index. Writers swap whole snapshots; readers load one
/// snapshot per query.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    current: ArcSwap<SpatialSnapshot>,
}

impl SpatialIndex {
    pub fn new(frame: CoordinateFrame) -> Self {
        Self {
            current: ArcSwap::from_pointee(SpatialSnapshot {
                frame,
                ..SpatialSnapshot::default()
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<SpatialSnapshot> {
        self.current.load_full()
    }

    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }

    pub fn frame(&self) -> CoordinateFrame {
        self.current.load().frame
    }

    /// Replaces records, keeping the current coordinate frame. Returns the new revision.
    pub fn replace_snapshot(
        &self,
        entities: Vec<SpatialEntity>,
        terrain: Vec<TerrainFeature>,
    ) -> u64 {
        self.swap(None, entities, terrain)
    }

    /// Replaces records and frame from a parsed report. Returns the new revision.
    pub fn replace_parsed(&self, parsed: ParsedState) -> u64 {
        let frame = parsed.frame();
        self.swap(Some(frame), parsed.entities, parsed.terrain)
    }

    fn swap(
        &self,
        frame: Option<CoordinateFrame>,
        entities: Vec<SpatialEntity>,
        terrain: Vec<TerrainFeature>,
    ) -> u64 {
        // The kept frame is read inside the closure so a retried swap sees the winner's frame.
        let previous = self.current.rcu(|current| SpatialSnapshot {
            revision: current.revision + 1,
            frame: frame.unwrap_or(current.frame),
            entities: entities.clone(),
            terrain: terrain.clone(),
        });
        let revision = previous.revision + 1;
        tracing::debug!(
            revision,
            entities = entities.len(),
            terrain = terrain.len(),
            "spatial snapshot replaced"
        );
        revision
    }

    pub fn entity(&self, id: &str) -> Option<SpatialEntity> {
        self.current.load().entity(id).cloned()
    }

    pub fn entities_at(&self, x: i32, z: i32) -> Vec<SpatialEntity> {
        self.current.load().entities_at(x, z).cloned().collect()
    }

    pub fn is_blocked(
        &self,
        x: i32,
        z: i32,
        ignore_entity_ids: &[&str],
        ignore_terrain_ids: &[&str],
    ) -> bool {
        self.current
            .load()
            .is_blocked(x, z, ignore_entity_ids, ignore_terrain_ids)
    }

    pub fn elevation_at(&self, x: i32, z: i32, ignore_entity_ids: &[&str]) -> f64 {
        self.current.load().elevation_at(x, z, ignore_entity_ids)
    }

    pub fn nearest_open_tile(
        &self,
        start_x: i32,
        start_z: i32,
        max_radius: u32,
        ignore_entity_ids: &[&str],
    ) -> Option<LocalTile> {
        self.current
            .load()
            .nearest_open_tile(start_x, start_z, max_radius, ignore_entity_ids)
    }
}
