//! Wire value types shared by packages and game state.

use serde::{Deserialize, Serialize};

/// An RGB color, serialized as a 3-element JSON array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl From<[u8; 3]> for Color {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

impl From<Color> for [u8; 3] {
    fn from(c: Color) -> Self {
        [c.r, c.g, c.b]
    }
}

/// A point on the integer map grid, serialized as a 2-element JSON array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i64; 2]", into = "[i64; 2]")]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl From<[i64; 2]> for Point {
    fn from([x, y]: [i64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [i64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// One player as it appears in snapshots and broadcast updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: u64,
    pub team_id: u64,
    pub nick: String,
    pub color: Color,
    pub health: f64,
    pub position: Point,
    pub angle: f64,
}

/// One ray as it appears in snapshots and broadcast updates.
///
/// The gradient/intercept pair is a server-side cache for ray intersection
/// math and never leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RayState {
    pub id: u64,
    pub source: Point,
    pub destination: Point,
    pub color: Color,
    #[serde(skip)]
    pub gradient: Option<f64>,
    #[serde(skip)]
    pub intercept: Option<f64>,
}

/// A value snapshot of a game's full state.
///
/// Snapshots are values, not views: mutations after the snapshot was taken
/// do not affect it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub players: Vec<PlayerState>,
    pub rays: Vec<RayState>,
}
