use serde::{Deserialize, Serialize};

pub const MIN_INTENSITY: f32 = 0.0;
pub const MAX_INTENSITY: f32 = 255.0;

pub fn clamp_intensity(value: f32) -> f32 {
    value.clamp(MIN_INTENSITY, MAX_INTENSITY)
}

/// A square grid of intensities in `[0, 255]`, stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    dim: usize,
    cells: Vec<f32>,
}

impl Grid {
    pub fn zeros(dim: usize) -> Self {
        Self { dim, cells: vec![0.0; dim * dim] }
    }

    /// Builds a grid from `f(x, y)`, clamping every value.
    pub fn from_fn(dim: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut cells = Vec::with_capacity(dim * dim);
        for y in 0..dim {
            for x in 0..dim {
                cells.push(clamp_intensity(f(x, y)));
            }
        }
        Self { dim, cells }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        (x < self.dim && y < self.dim).then(|| self.cells[y * self.dim + x])
    }

    /// Zero-padded sampling: anything outside the grid reads as 0.
    pub fn sample(&self, x: i64, y: i64) -> f32 {
        if x < 0 || y < 0 {
            return 0.0;
        }
        self.get(x as usize, y as usize).unwrap_or(0.0)
    }

    pub fn values(&self) -> &[f32] {
        &self.cells
    }
}

/// An output feature map that may be only partially computed.
/// `None` is the "unset" sentinel, rendered black.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputGrid {
    dim: usize,
    cells: Vec<Option<f32>>,
}

impl OutputGrid {
    pub fn unset(dim: usize) -> Self {
        Self { dim, cells: vec![None; dim * dim] }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x < self.dim && y < self.dim {
            self.cells[y * self.dim + x]
        } else {
            None
        }
    }

    /// Writes a cell, returning `false` when `(x, y)` is outside the grid.
    pub fn set(&mut self, x: usize, y: usize, value: f32) -> bool {
        if x >= self.dim || y >= self.dim {
            return false;
        }
        self.cells[y * self.dim + x] = Some(clamp_intensity(value));
        true
    }

    pub fn filled_count(&self) -> usize {
        self.cells.iter().filter(|cell| cell.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    pub fn filled_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.cells.iter().flatten().copied()
    }

    /// The value to paint for a cell: unset cells are black.
    pub fn display_value(&self, x: usize, y: usize) -> u8 {
        self.get(x, y).map(|v| v.floor() as u8).unwrap_or(0)
    }
}
