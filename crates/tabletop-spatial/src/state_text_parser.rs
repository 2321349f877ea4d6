//! Tolerant parser for the worker's plain-text combat state report.
//!
//! The report is line oriented: section headers select terrain or combatant
//! parsing, bullets carry one record each, and a `Grid:`/`Map size:` line sets
//! the grid extent. Records that do not parse are skipped with a
//! [`ParseDiagnostic`]; the report as a whole never fails.

use std::{collections::HashSet, sync::OnceLock};

use regex::Regex;
use thiserror::Error;

use crate::{
    CoordinateFrame, CoverLevel, EntityAttributes, EntityKind, LocalPosition, LocalTile,
    RemoteTile, SpatialEntity, TerrainDimensions, TerrainFeature, TerrainKind, DEFAULT_GRID_EXTENT,
};

pub const FEET_PER_GRID_UNIT: f64 = 5.0;

const TERRAIN_SECTION_WORDS: &[&str] = &["terrain", "obstacles", "obstacle", "features"];
const COMBATANT_SECTION_WORDS: &[&str] = &[
    "combatants",
    "combatant",
    "creatures",
    "entities",
    "initiative",
];

/// Lowercase name fragments treated as hostile when no allegiance is given.
const HOSTILE_NAME_FRAGMENTS: &[&str] = &[
    "goblin", "orc", "kobold", "bandit", "skeleton", "zombie", "wolf", "troll", "ogre", "dragon",
    "cultist", "gnoll", "bugbear", "spider", "ghoul", "wight", "lich", "vampire", "demon",
    "devil", "owlbear", "mimic", "beholder", "hag", "wraith", "specter", "harpy", "basilisk",
    "manticore", "minotaur", "ettin", "drow", "duergar", "assassin", "brigand", "raider",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("terrain entry is not '<kind> at (x,y) - WxD[xH]ft [flags]'")]
    MalformedTerrain,
    #[error("combatant entry is not '<name> at (x,y[,z]) <size> creature'")]
    MalformedCombatant,
    #[error("unrecognized creature size '{size}'")]
    UnknownSize { size: String },
    #[error("coordinate ({x},{y}) lies outside the {extent}x{extent} grid")]
    OutOfGrid { x: i32, y: i32, extent: u32 },
    #[error("dimension '{value}' must be a positive number of feet")]
    InvalidDimension { value: String },
    #[error("number '{value}' is out of range")]
    NumberOutOfRange { value: String },
}

/// One skipped report line. `line_number` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDiagnostic {
    pub line_number: usize,
    pub line: String,
    pub error: ParseError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedState {
    pub entities: Vec<SpatialEntity>,
    pub terrain: Vec<TerrainFeature>,
    pub grid_extent: u32,
    pub diagnostics: Vec<ParseDiagnostic>,
}

impl ParsedState {
    pub fn frame(&self) -> CoordinateFrame {
        CoordinateFrame::new(self.grid_extent)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.terrain.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Terrain,
    Combatants,
}

/// Parses one state report. Coordinates in the result are local.
pub fn parse_state_text(text: &str) -> ParsedState {
    let grid_extent = detect_grid_extent(text).unwrap_or(DEFAULT_GRID_EXTENT);
    let mut builder = ParsedStateBuilder::new(CoordinateFrame::new(grid_extent));
    let mut section = None;

    for (index, line) in text.lines().enumerate() {
        let Some(body) = bullet_body(line) else {
            if let Some(next) = classify_header(line) {
                section = next;
            }
            continue;
        };
        let outcome = match section {
            Some(Section::Terrain) => builder.push_terrain(body),
            Some(Section::Combatants) => builder.push_combatant(body),
            None => continue,
        };
        if let Err(error) = outcome {
            let line_number = index + 1;
            tracing::debug!(line_number, error = %error, "skipping malformed state report line");
            builder.diagnostics.push(ParseDiagnostic {
                line_number,
                line: line.to_string(),
                error,
            });
        }
    }

    builder.finish(grid_extent)
}

struct ParsedStateBuilder {
    frame: CoordinateFrame,
    entities: Vec<SpatialEntity>,
    terrain: Vec<TerrainFeature>,
    diagnostics: Vec<ParseDiagnostic>,
    entity_ids: HashSet<String>,
}

impl ParsedStateBuilder {
    fn new(frame: CoordinateFrame) -> Self {
        Self {
            frame,
            entities: Vec::new(),
            terrain: Vec::new(),
            diagnostics: Vec::new(),
            entity_ids: HashSet::new(),
        }
    }

    fn push_terrain(&mut self, body: &str) -> Result<(), ParseError> {
        let captures = terrain_pattern()
            .captures(body)
            .ok_or(ParseError::MalformedTerrain)?;
        let label = clean_label(&captures["kind"]);
        if label.is_empty() {
            return Err(ParseError::MalformedTerrain);
        }
        let tile = self.local_tile(&captures["x"], &captures["y"])?;
        let width = parse_feet(&captures["width"])?;
        let depth = parse_feet(&captures["depth"])?;
        let height = match captures.name("height") {
            Some(height) => parse_feet_allow_zero(height.as_str())?,
            None => 0.0,
        };

        let mut feature = TerrainFeature {
            id: format!("terrain-{}", self.terrain.len() + 1),
            kind: TerrainKind::from_label(label),
            position: LocalPosition::on_ground(tile),
            dimensions: TerrainDimensions {
                width: feet_to_tiles(width),
                depth: feet_to_tiles(depth),
                height: height / FEET_PER_GRID_UNIT,
            },
            blocks_movement: false,
            blocks_sight: false,
            difficult: false,
            cover: CoverLevel::None,
        };
        if let Some(flags) = captures.name("flags") {
            apply_terrain_flags(&mut feature, flags.as_str());
        }
        self.terrain.push(feature);
        Ok(())
    }

    fn push_combatant(&mut self, body: &str) -> Result<(), ParseError> {
        let captures = combatant_pattern()
            .captures(body)
            .ok_or(ParseError::MalformedCombatant)?;
        let name = clean_label(&captures["name"]);
        if name.is_empty() {
            return Err(ParseError::MalformedCombatant);
        }
        let tile = self.local_tile(&captures["x"], &captures["y"])?;
        let elevation = match captures.name("z") {
            Some(z) => parse_number::<f64>(z.as_str())?,
            None => 0.0,
        };
        let rest = captures.name("rest").map_or("", |rest| rest.as_str());
        let size_units = parse_size(rest)?;
        let attributes = parse_attributes(rest)?;
        let kind = explicit_allegiance(rest).unwrap_or_else(|| classify_by_name(name));

        let id = self.unique_entity_id(name);
        self.entities.push(SpatialEntity {
            id,
            name: name.to_string(),
            kind,
            size_units,
            position: LocalPosition {
                x: tile.x,
                y: elevation,
                z: tile.z,
            },
            attributes,
            primary: false,
        });
        Ok(())
    }

    fn local_tile(&self, raw_x: &str, raw_y: &str) -> Result<LocalTile, ParseError> {
        let remote = RemoteTile::new(parse_number(raw_x)?, parse_number(raw_y)?);
        if !self.frame.contains_remote(remote) {
            return Err(ParseError::OutOfGrid {
                x: remote.x,
                y: remote.y,
                extent: self.frame.grid_extent(),
            });
        }
        Ok(self.frame.to_local(remote))
    }

    fn unique_entity_id(&mut self, name: &str) -> String {
        let base = slugify(name);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.entity_ids.contains(&candidate) {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        self.entity_ids.insert(candidate.clone());
        candidate
    }

    fn finish(mut self, grid_extent: u32) -> ParsedState {
        if let Some(first_ally) = self
            .entities
            .iter_mut()
            .find(|entity| entity.kind == EntityKind::Ally)
        {
            first_ally.primary = true;
        }
        ParsedState {
            entities: self.entities,
            terrain: self.terrain,
            grid_extent,
            diagnostics: self.diagnostics,
        }
    }
}

fn bullet_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(?P<body>.*\S)\s*$").expect("bullet pattern")
    })
}

fn terrain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^(?P<kind>.+?)\s+at\s*\(\s*(?P<x>-?\d+)\s*,\s*(?P<y>-?\d+)\s*\)",
            r"\s*[-–—:]?\s*(?P<width>\d+(?:\.\d+)?)\s*x\s*(?P<depth>\d+(?:\.\d+)?)",
            r"(?:\s*x\s*(?P<height>\d+(?:\.\d+)?))?\s*(?:ft|feet|')?\.?",
            r"\s*(?:\[(?P<flags>[^\]]*)\])?",
        ))
        .expect("terrain pattern")
    })
}

fn combatant_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^(?P<name>.+?)\s+at\s*\(\s*(?P<x>-?\d+)\s*,\s*(?P<y>-?\d+)\s*",
            r"(?:,\s*(?P<z>-?\d+(?:\.\d+)?)\s*)?\)(?P<rest>.*)$",
        ))
        .expect("combatant pattern")
    })
}

fn grid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:grid(?:\s+size)?|map\s+size)\s*:\s*(?P<width>\d+)(?:\s*(?:x|×|by)\s*(?P<height>\d+))?",
        )
        .expect("grid pattern")
    })
}

fn sized_creature_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?P<size>[a-z]+|\d+)\s+creature\b").expect("size pattern")
    })
}

fn size_word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?P<size>tiny|small|medium|large|huge|gargantuan)\b")
            .expect("size word pattern")
    })
}

fn hit_points_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bhp\s*:?\s*(?P<current>-?\d+)\s*/\s*(?P<max>\d+)").expect("hp pattern")
    })
}

fn armor_class_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\bac\s*:?\s*(?P<ac>\d+)\b").expect("ac pattern"))
}

fn conditions_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bconditions?\s*:\s*(?P<list>[^;|\[\]()]*)").expect("conditions pattern")
    })
}

fn allegiance_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?P<word>hostile|enemy|enemies|ally|allied|party|player|npc|neutral)\b",
        )
        .expect("allegiance pattern")
    })
}

fn detect_grid_extent(text: &str) -> Option<u32> {
    let captures = grid_pattern().captures(text)?;
    let width = captures["width"].parse::<u32>().ok()?;
    let height = match captures.name("height") {
        Some(height) => height.as_str().parse::<u32>().ok()?,
        None => width,
    };
    Some(width.max(height)).filter(|extent| *extent > 0)
}

fn bullet_body(line: &str) -> Option<&str> {
    bullet_pattern()
        .captures(line)
        .and_then(|captures| captures.name("body"))
        .map(|body| body.as_str())
}

/// `Some(section)` for a header line (`Some(None)` closes the current section),
/// `None` for ordinary text.
fn classify_header(line: &str) -> Option<Option<Section>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let emphasized = trimmed.starts_with('#') || trimmed.starts_with('*');
    let text = trimmed.trim_matches(|ch: char| ch == '#' || ch == '*' || ch.is_whitespace());
    let ends_with_colon = text.ends_with(':');
    let lowered = text.trim_end_matches(':').to_ascii_lowercase();
    let words = lowered
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>();
    let section = words.iter().find_map(|word| {
        if TERRAIN_SECTION_WORDS.contains(word) {
            Some(Section::Terrain)
        } else if COMBATANT_SECTION_WORDS.contains(word) {
            Some(Section::Combatants)
        } else {
            None
        }
    });
    if emphasized || ends_with_colon {
        return Some(section);
    }
    if words.len() <= 3 {
        return section.map(Some);
    }
    None
}

fn apply_terrain_flags(feature: &mut TerrainFeature, flags: &str) {
    for flag in flags.split([',', ';']) {
        let flag = flag.trim().to_ascii_lowercase();
        match flag.as_str() {
            "" => {}
            "blocks movement" | "impassable" => feature.blocks_movement = true,
            "blocks sight" | "blocks line of sight" | "blocks vision" | "opaque" => {
                feature.blocks_sight = true
            }
            "difficult terrain" | "difficult" => feature.difficult = true,
            "half cover" => feature.cover = feature.cover.max(CoverLevel::Half),
            "three-quarters cover" | "three quarters cover" | "3/4 cover" => {
                feature.cover = feature.cover.max(CoverLevel::ThreeQuarters)
            }
            "total cover" | "full cover" => feature.cover = CoverLevel::Total,
            other => {
                tracing::debug!(terrain_id = %feature.id, flag = other, "ignoring unknown terrain flag")
            }
        }
    }
}

fn parse_size(rest: &str) -> Result<u32, ParseError> {
    if let Some(captures) = size_word_pattern().captures(rest) {
        return Ok(size_units(&captures["size"]).unwrap_or(1));
    }
    let Some(captures) = sized_creature_pattern().captures(rest) else {
        return Ok(1);
    };
    let size = &captures["size"];
    if let Some(units) = size_units(size) {
        return Ok(units);
    }
    // Only an explicit count is rejected; other descriptors ("undead", "the")
    // fall back to one tile.
    if size.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ParseError::UnknownSize {
            size: size.to_string(),
        });
    }
    if explicit_allegiance(size).is_none() && !["a", "an", "the"].contains(&size) {
        tracing::debug!(descriptor = size, "unrecognized creature size, assuming one tile");
    }
    Ok(1)
}

fn size_units(size: &str) -> Option<u32> {
    match size.to_ascii_lowercase().as_str() {
        "tiny" | "small" | "medium" => Some(1),
        "large" => Some(2),
        "huge" => Some(3),
        "gargantuan" => Some(4),
        other => other.parse::<u32>().ok().filter(|units| *units > 0),
    }
}

fn parse_attributes(rest: &str) -> Result<EntityAttributes, ParseError> {
    let mut attributes = EntityAttributes::default();
    if let Some(captures) = hit_points_pattern().captures(rest) {
        attributes.hp_current = Some(parse_number(&captures["current"])?);
        attributes.hp_max = Some(parse_number(&captures["max"])?);
    }
    if let Some(captures) = armor_class_pattern().captures(rest) {
        attributes.armor_class = Some(parse_number(&captures["ac"])?);
    }
    if let Some(captures) = conditions_pattern().captures(rest) {
        attributes.conditions = captures["list"]
            .split(',')
            .map(str::trim)
            .filter(|condition| !condition.is_empty() && !condition.eq_ignore_ascii_case("none"))
            .map(str::to_string)
            .collect();
    }
    Ok(attributes)
}

fn explicit_allegiance(rest: &str) -> Option<EntityKind> {
    let captures = allegiance_pattern().captures(rest)?;
    match captures["word"].to_ascii_lowercase().as_str() {
        "hostile" | "enemy" | "enemies" => Some(EntityKind::Hostile),
        "ally" | "allied" | "party" | "player" => Some(EntityKind::Ally),
        "npc" | "neutral" => Some(EntityKind::Npc),
        _ => None,
    }
}

fn classify_by_name(name: &str) -> EntityKind {
    let lowered = name.to_ascii_lowercase();
    if HOSTILE_NAME_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
    {
        EntityKind::Hostile
    } else {
        EntityKind::Ally
    }
}

fn clean_label(raw: &str) -> &str {
    raw.trim_matches(|ch: char| ch == '*' || ch == '_' || ch == '`' || ch.is_whitespace())
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            slug.push(ch);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "entity".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Result<T, ParseError> {
    raw.parse::<T>().map_err(|_| ParseError::NumberOutOfRange {
        value: raw.to_string(),
    })
}

fn parse_feet(raw: &str) -> Result<f64, ParseError> {
    let feet = parse_feet_allow_zero(raw)?;
    if feet <= 0.0 {
        return Err(ParseError::InvalidDimension {
            value: raw.to_string(),
        });
    }
    Ok(feet)
}

fn parse_feet_allow_zero(raw: &str) -> Result<f64, ParseError> {
    raw.parse::<f64>()
        .ok()
        .filter(|feet| feet.is_finite() && *feet >= 0.0)
        .ok_or_else(|| ParseError::InvalidDimension {
            value: raw.to_string(),
        })
}

fn feet_to_tiles(feet: f64) -> u32 {
    ((feet / FEET_PER_GRID_UNIT).ceil() as u32).max(1)
}
