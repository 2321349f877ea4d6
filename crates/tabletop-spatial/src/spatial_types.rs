//! Typed records produced by the state report parser.

use serde::{Deserialize, Serialize};

use crate::LocalTile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ally,
    Npc,
    Hostile,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ally => "ally",
            Self::Npc => "npc",
            Self::Hostile => "hostile",
        }
    }
}

/// Position in local grid space; `y` is elevation in grid units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalPosition {
    pub x: i32,
    pub y: f64,
    pub z: i32,
}

impl LocalPosition {
    pub fn on_ground(tile: LocalTile) -> Self {
        Self {
            x: tile.x,
            y: 0.0,
            z: tile.z,
        }
    }

    pub fn tile(&self) -> LocalTile {
        LocalTile::new(self.x, self.z)
    }
}

/// Axis-aligned rectangle of tiles anchored at its minimum corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    pub min: LocalTile,
    pub width: u32,
    pub depth: u32,
}

impl Footprint {
    pub fn contains(&self, x: i32, z: i32) -> bool {
        let (x, z) = (i64::from(x), i64::from(z));
        let (min_x, min_z) = (i64::from(self.min.x), i64::from(self.min.z));
        x >= min_x
            && x < min_x + i64::from(self.width)
            && z >= min_z
            && z < min_z + i64::from(self.depth)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityAttributes {
    pub hp_current: Option<i32>,
    pub hp_max: Option<i32>,
    pub armor_class: Option<u32>,
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialEntity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub size_units: u32,
    pub position: LocalPosition,
    #[serde(default)]
    pub attributes: EntityAttributes,
    /// Presentation-only marker for the first ally in a report.
    #[serde(default)]
    pub primary: bool,
}

impl SpatialEntity {
    pub fn footprint(&self) -> Footprint {
        let size = self.size_units.max(1);
        Footprint {
            min: self.position.tile(),
            width: size,
            depth: size,
        }
    }

    pub fn height(&self) -> f64 {
        f64::from(self.size_units.max(1))
    }

    pub fn top(&self) -> f64 {
        self.position.y + self.height()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerrainKind {
    Wall,
    Pillar,
    Boulder,
    Tree,
    Table,
    Crate,
    Barrel,
    Rubble,
    Water,
    Pit,
    Door,
    Other(String),
}

impl TerrainKind {
    /// Maps a report label such as `Stone wall` onto a known kind by its last word.
    pub fn from_label(label: &str) -> Self {
        let trimmed = label.trim();
        let head = trimmed
            .split_whitespace()
            .last()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match head.strip_suffix('s').unwrap_or(&head) {
            "wall" => Self::Wall,
            "pillar" | "column" => Self::Pillar,
            "boulder" | "rock" => Self::Boulder,
            "tree" => Self::Tree,
            "table" => Self::Table,
            "crate" | "box" => Self::Crate,
            "barrel" => Self::Barrel,
            "rubble" => Self::Rubble,
            "water" | "pool" => Self::Water,
            "pit" => Self::Pit,
            "door" => Self::Door,
            _ => Self::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Wall => "wall",
            Self::Pillar => "pillar",
            Self::Boulder => "boulder",
            Self::Tree => "tree",
            Self::Table => "table",
            Self::Crate => "crate",
            Self::Barrel => "barrel",
            Self::Rubble => "rubble",
            Self::Water => "water",
            Self::Pit => "pit",
            Self::Door => "door",
            Self::Other(label) => label.as_str(),
        }
    }
}

/// Ordered from least to most protection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CoverLevel {
    #[default]
    None,
    Half,
    ThreeQuarters,
    Total,
}

/// Width and depth in tiles, height in grid units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerrainDimensions {
    pub width: u32,
    pub depth: u32,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainFeature {
    pub id: String,
    pub kind: TerrainKind,
    pub position: LocalPosition,
    pub dimensions: TerrainDimensions,
    #[serde(default)]
    pub blocks_movement: bool,
    #[serde(default)]
    pub blocks_sight: bool,
    #[serde(default)]
    pub difficult: bool,
    #[serde(default)]
    pub cover: CoverLevel,
}

impl TerrainFeature {
    pub fn footprint(&self) -> Footprint {
        Footprint {
            min: self.position.tile(),
            width: self.dimensions.width.max(1),
            depth: self.dimensions.depth.max(1),
        }
    }

    pub fn top(&self) -> f64 {
        self.position.y + self.dimensions.height
    }
}
