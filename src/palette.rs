//! Fixed route color palette.
//!
//! A route's color is picked once, when the route is built, from its ordinal
//! position. It is persisted with the route and never recomputed.

use serde::{Deserialize, Serialize};

/// Color token assigned to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteColor {
    Blue,
    Red,
    Green,
    Orange,
    Purple,
    Pink,
    Teal,
    Yellow,
}

/// Palette order used by [`color_for_index`].
pub const PALETTE: [RouteColor; 8] = [
    RouteColor::Blue,
    RouteColor::Red,
    RouteColor::Green,
    RouteColor::Orange,
    RouteColor::Purple,
    RouteColor::Pink,
    RouteColor::Teal,
    RouteColor::Yellow,
];

/// Color for the route at ordinal position `index`, wrapping around the palette.
pub fn color_for_index(index: usize) -> RouteColor {
    PALETTE[index % PALETTE.len()]
}

impl RouteColor {
    /// Hex RGB value for renderers.
    pub fn hex(&self) -> &'static str {
        match self {
            RouteColor::Blue => "#007AFF",
            RouteColor::Red => "#FF3B30",
            RouteColor::Green => "#34C759",
            RouteColor::Orange => "#FF9500",
            RouteColor::Purple => "#AF52DE",
            RouteColor::Pink => "#FF2D55",
            RouteColor::Teal => "#30B0C7",
            RouteColor::Yellow => "#FFCC00",
        }
    }
}
