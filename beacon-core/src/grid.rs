//! Spatial quantization: continuous observer position -> grid cell.
//!
//! Each axis is scaled then floored, so a horizontal multiplier of 8 gives
//! cells 1/8 unit wide. The vertical axis (z) has its own scale.

use serde::{Deserialize, Serialize};

use crate::types::{CellKey, Position};

/// Default cells per unit on x and y.
pub const DEFAULT_HORIZONTAL_MULTIPLIER: f32 = 8.0;

/// Default cells per unit on z.
pub const DEFAULT_VERTICAL_MULTIPLIER: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridQuantizer {
    pub horizontal_multiplier: f32,
    pub vertical_multiplier: f32,
}

impl Default for GridQuantizer {
    fn default() -> Self {
        GridQuantizer::new(DEFAULT_HORIZONTAL_MULTIPLIER, DEFAULT_VERTICAL_MULTIPLIER)
    }
}

impl GridQuantizer {
    pub fn new(horizontal_multiplier: f32, vertical_multiplier: f32) -> Self {
        GridQuantizer {
            horizontal_multiplier,
            vertical_multiplier,
        }
    }

    /// Cell containing `pos`. Pure; equal inputs give equal keys.
    pub fn cell_key_of(&self, pos: Position) -> CellKey {
        CellKey::new(
            quantize(pos.x, self.horizontal_multiplier),
            quantize(pos.y, self.horizontal_multiplier),
            quantize(pos.z, self.vertical_multiplier),
        )
    }

    /// Center of a cell in local coordinates.
    pub fn cell_center(&self, cell: CellKey) -> Position {
        Position::new(
            center(cell.x, self.horizontal_multiplier),
            center(cell.y, self.horizontal_multiplier),
            center(cell.z, self.vertical_multiplier),
        )
    }

    /// Edge length of a cell on each axis.
    pub fn cell_size(&self) -> Position {
        Position::new(
            1.0 / self.horizontal_multiplier,
            1.0 / self.horizontal_multiplier,
            1.0 / self.vertical_multiplier,
        )
    }
}

fn quantize(v: f32, multiplier: f32) -> i32 {
    (v * multiplier).floor() as i32
}

fn center(k: i32, multiplier: f32) -> f32 {
    (k as f32 + 0.5) / multiplier
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
