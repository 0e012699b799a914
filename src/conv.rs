//! Sliding-window arithmetic for a single simulated filter.
//!
//! The filter is not learned: every tap on the kernel's centre row or centre
//! column weighs `+1.0`, every other tap `-0.1`, giving a plus-shaped detector
//! that depends only on the kernel size.

use std::fmt;

use serde::Serialize;
use tracing::trace;

use crate::error::{Result, SimError};
use crate::grid::{Grid, OutputGrid, clamp_intensity};
use crate::model::{Activation, SessionParams};

pub const CROSS_WEIGHT: f32 = 1.0;
pub const OFF_CROSS_WEIGHT: f32 = -0.1;

/// `floor((input - kernel + 2*padding) / stride + 1)`, rejecting shapes with no output.
pub fn output_dim(input_dim: usize, kernel_size: usize, stride: usize, padding: usize) -> Result<usize> {
    if kernel_size == 0 {
        return Err(SimError::InvalidParameter { name: "kernel_size", value: 0 });
    }
    if stride == 0 {
        return Err(SimError::InvalidParameter { name: "stride", value: 0 });
    }
    let span = input_dim as i64 - kernel_size as i64 + 2 * padding as i64;
    let dim = span.div_euclid(stride as i64) + 1;
    if dim <= 0 {
        return Err(SimError::DegenerateOutputDimension { input_dim, kernel_size, stride, padding });
    }
    Ok(dim as usize)
}

pub fn kernel_weight(kernel_size: usize, kx: usize, ky: usize) -> f32 {
    let centre = kernel_size / 2;
    if kx == centre || ky == centre { CROSS_WEIGHT } else { OFF_CROSS_WEIGHT }
}

/// The full `k x k` weight matrix, row-major, as actually used by [`evaluate_cell`].
pub fn kernel_weights(kernel_size: usize) -> Vec<Vec<f32>> {
    (0..kernel_size)
        .map(|ky| (0..kernel_size).map(|kx| kernel_weight(kernel_size, kx, ky)).collect())
        .collect()
}

/// One `(sample, weight)` pair of the dot product.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Term {
    pub sample: f32,
    pub weight: f32,
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}×{})", self.sample.floor() as i64, self.weight)
    }
}

/// Everything needed to explain how one output cell was computed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepDiagnostic {
    pub cell: (usize, usize),
    /// Kernel taps in row-major kernel order.
    pub terms: Vec<Term>,
    pub scaled_bias: f32,
    pub result: f32,
}

impl StepDiagnostic {
    pub fn terms_text(&self) -> String {
        self.terms.iter().map(Term::to_string).collect::<Vec<_>>().join(" + ")
    }

    pub fn bias_text(&self) -> String {
        format!("{:.1}", self.scaled_bias)
    }

    pub fn result_text(&self) -> String {
        format!("{:.1}", self.result)
    }
}

pub fn apply_activation(activation: Activation, sum: f32) -> f32 {
    match activation {
        Activation::Relu => sum.max(0.0),
        Activation::Linear => sum,
    }
}

/// Computes output cell `(x, y)`. Taps falling outside `input` read as zero.
pub fn evaluate_cell(input: &Grid, params: &SessionParams, bias: f32, x: usize, y: usize) -> StepDiagnostic {
    let k = params.kernel_size;
    let start_x = (x * params.stride) as i64 - params.padding as i64;
    let start_y = (y * params.stride) as i64 - params.padding as i64;

    let mut sum = 0.0f32;
    let mut terms = Vec::with_capacity(k * k);
    for ky in 0..k {
        for kx in 0..k {
            let sample = input.sample(start_x + kx as i64, start_y + ky as i64);
            let weight = kernel_weight(k, kx, ky);
            sum += sample * weight;
            terms.push(Term { sample, weight });
        }
    }

    let scaled_bias = bias * 255.0;
    sum += scaled_bias;
    let result = clamp_intensity(apply_activation(params.activation, sum));
    trace!(x, y, result, "evaluated cell");

    StepDiagnostic { cell: (x, y), terms, scaled_bias, result }
}

/// Evaluates every output cell at once, independent of any animation state.
pub fn evaluate_full_layer(input: &Grid, params: &SessionParams, bias: f32) -> Result<OutputGrid> {
    let dim = output_dim(input.dim(), params.kernel_size, params.stride, params.padding)?;
    let mut out = OutputGrid::unset(dim);
    for y in 0..dim {
        for x in 0..dim {
            out.set(x, y, evaluate_cell(input, params, bias, x, y).result);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PoolMode;
    use approx::assert_abs_diff_eq;

    fn params(kernel_size: usize, stride: usize, padding: usize, activation: Activation) -> SessionParams {
        SessionParams {
            kernel_size,
            stride,
            padding,
            output_channels: 64,
            pool: PoolMode::None,
            activation,
        }
    }

    #[test]
    fn output_dim_matches_layer_references() {
        assert_eq!(output_dim(32, 5, 1, 2).ok(), Some(32));
        assert_eq!(output_dim(16, 5, 1, 2).ok(), Some(16));
        assert_eq!(output_dim(16, 3, 2, 1).ok(), Some(8));
        assert_eq!(output_dim(8, 3, 3, 0).ok(), Some(2));
    }

    #[test]
    fn output_dim_rejects_degenerate_shapes() {
        assert!(matches!(output_dim(8, 11, 1, 0), Err(SimError::DegenerateOutputDimension { .. })));
        // (8 - 10) / 3 + 1 floors to 0
        assert!(matches!(output_dim(8, 10, 3, 0), Err(SimError::DegenerateOutputDimension { .. })));
        assert!(matches!(output_dim(8, 3, 0, 0), Err(SimError::InvalidParameter { name: "stride", .. })));
        assert!(matches!(output_dim(8, 0, 1, 0), Err(SimError::InvalidParameter { name: "kernel_size", .. })));
    }

    #[test]
    fn kernel_is_a_plus_shape() {
        let weights = kernel_weights(3);
        assert_eq!(
            weights,
            vec![
                vec![-0.1, 1.0, -0.1],
                vec![1.0, 1.0, 1.0],
                vec![-0.1, 1.0, -0.1],
            ]
        );
        let crosses = kernel_weights(5).iter().flatten().filter(|w| **w == CROSS_WEIGHT).count();
        assert_eq!(crosses, 9);
    }

    #[test]
    fn zero_input_with_positive_bias_yields_scaled_bias() {
        let input = Grid::zeros(32);
        let diag = evaluate_cell(&input, &params(5, 1, 2, Activation::Relu), 0.1, 0, 0);
        assert_abs_diff_eq!(diag.result, 25.5, epsilon = 1e-4);
        assert_abs_diff_eq!(diag.scaled_bias, 25.5, epsilon = 1e-4);
        assert_eq!(diag.terms.len(), 25);
    }

    #[test]
    fn negative_bias_is_cut_by_relu() {
        let input = Grid::zeros(32);
        let diag = evaluate_cell(&input, &params(5, 1, 2, Activation::Relu), -0.2, 0, 0);
        assert_eq!(diag.result, 0.0);
        assert_abs_diff_eq!(diag.scaled_bias, -51.0, epsilon = 1e-4);
    }

    #[test]
    fn padded_taps_contribute_nothing() {
        let input = Grid::from_fn(4, |_, _| 50.0);
        let diag = evaluate_cell(&input, &params(3, 1, 1, Activation::Linear), 0.0, 0, 0);
        // Top row and left column of the window sit in the padding.
        assert!(
            diag.terms
                .iter()
                .enumerate()
                .filter(|(i, _)| i / 3 == 0 || i % 3 == 0)
                .all(|(_, t)| t.sample == 0.0)
        );
        // Remaining taps: three on the cross, one off it.
        assert_abs_diff_eq!(diag.result, 150.0 - 5.0, epsilon = 1e-3);
    }

    #[test]
    fn linear_activation_only_applies_final_clamp() {
        let input = Grid::from_fn(3, |x, y| if x == 1 || y == 1 { 0.0 } else { 200.0 });
        // Centre cell: four corner taps of 200 at -0.1 each.
        let linear = evaluate_cell(&input, &params(3, 1, 1, Activation::Linear), 0.0, 1, 1);
        assert_eq!(linear.result, 0.0);
        let lifted = evaluate_cell(&input, &params(3, 1, 1, Activation::Linear), 0.5, 1, 1);
        assert_abs_diff_eq!(lifted.result, 127.5 - 80.0, epsilon = 1e-3);
    }

    #[test]
    fn diagnostic_text_matches_dot_product_notation() {
        let input = Grid::from_fn(3, |x, y| (x + y * 3) as f32 + 0.7);
        let diag = evaluate_cell(&input, &params(3, 1, 0, Activation::Relu), 0.1, 0, 0);
        assert!(diag.terms_text().starts_with("(0×-0.1) + (1×1) + (2×-0.1) + (3×1)"));
        assert_eq!(diag.bias_text(), "25.5");
        assert_eq!(diag.result_text(), format!("{:.1}", diag.result));
    }

    #[test]
    fn full_layer_is_deterministic() {
        let input = Grid::from_fn(16, |x, y| ((x * 37 + y * 11) % 256) as f32);
        let p = params(5, 2, 2, Activation::Relu);
        let a = evaluate_full_layer(&input, &p, 0.05).expect("valid shape");
        let b = evaluate_full_layer(&input, &p, 0.05).expect("valid shape");
        assert_eq!(a, b);
        assert_eq!(a.dim(), 8);
        assert!(a.is_complete());
    }
}
