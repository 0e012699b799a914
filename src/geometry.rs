//! Mapping between the fixed-size display, the input grid and the output grid.

use serde::Serialize;

/// Default edge length of the square canvases the grids are drawn on.
pub const DEFAULT_DISPLAY_SIZE_PX: f32 = 300.0;

/// A square region in input-grid cells. May hang over the grid edge, which is
/// how zero padding shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellRect {
    pub left: i64,
    pub top: i64,
    pub size: usize,
}

impl CellRect {
    /// Scales the rectangle to display pixels for a grid of side `dim`.
    pub fn to_display(&self, display_size_px: f32, dim: usize) -> DisplayRect {
        let scale = display_size_px / dim as f32;
        DisplayRect {
            left: self.left as f32 * scale,
            top: self.top as f32 * scale,
            width: self.size as f32 * scale,
            height: self.size as f32 * scale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Pointer position (relative to the canvas origin) to an input cell, or
/// `None` if the pointer is outside the grid.
pub fn display_to_input_cell(
    pointer_x: f32,
    pointer_y: f32,
    display_size_px: f32,
    input_dim: usize,
) -> Option<(usize, usize)> {
    if input_dim == 0 || display_size_px <= 0.0 {
        return None;
    }
    let scale = display_size_px / input_dim as f32;
    let ix = (pointer_x / scale).floor();
    let iy = (pointer_y / scale).floor();
    let in_range = |v: f32| v >= 0.0 && v < input_dim as f32;
    (in_range(ix) && in_range(iy)).then_some((ix as usize, iy as usize))
}

/// The output cell whose window starts nearest `(ix, iy)`, ignoring padding.
pub fn input_cell_to_output_cell(ix: usize, iy: usize, stride: usize, output_dim: usize) -> Option<(usize, usize)> {
    if stride == 0 {
        return None;
    }
    let (ox, oy) = (ix / stride, iy / stride);
    (ox < output_dim && oy < output_dim).then_some((ox, oy))
}

pub fn output_cell_to_receptive_field(ox: usize, oy: usize, stride: usize, padding: usize, kernel_size: usize) -> CellRect {
    CellRect {
        left: (ox * stride) as i64 - padding as i64,
        top: (oy * stride) as i64 - padding as i64,
        size: kernel_size,
    }
}

/// The highlighted cell on the output canvas.
pub fn output_cell_rect(ox: usize, oy: usize) -> CellRect {
    CellRect { left: ox as i64, top: oy as i64, size: 1 }
}
