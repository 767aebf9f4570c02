//! Snapshot frames published to clients once per tick.
//!
//! A snapshot is an immutable capture of what one player is allowed to see;
//! building it never mutates game state, and clients render it as-is.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const COLOR_DEFAULT: u8 = 3;
pub const COLOR_SELF: u8 = 1;
pub const COLOR_ENEMY: u8 = 2;
pub const COLOR_RESOURCE: u8 = 4;

/// One rendered cell: what to draw and in which color pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolCell {
    pub symbol: String,
    pub color: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceView {
    pub value: String,
    pub bound: String,
    pub limit: String,
    pub iron: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnologyView {
    pub cur: u32,
    pub max: u32,
    pub active: bool,
}

/// Everything a client needs to draw one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Visible field, row-major.
    pub field: Vec<Vec<SymbolCell>>,
    /// One-line summary of all players.
    pub players: String,
    /// Keyed by resource name.
    pub resources: BTreeMap<String, ResourceView>,
    /// Keyed by technology name.
    pub technologies: BTreeMap<String, TechnologyView>,
    /// In-flight potentials keyed by `row|col`.
    pub potentials: BTreeMap<String, SymbolCell>,
    /// Audio cursor in seconds.
    pub audio_played: f64,
}
