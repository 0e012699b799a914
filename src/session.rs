//! The stepping state machine behind the simulator.
//!
//! An [`EngineSession`] owns everything about the focused layer: its
//! parameters, input grid, partially filled output grid, cursor and playback
//! state. Every operation takes `&mut self`, so calls on one session are
//! serialized by construction.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::conv::{evaluate_cell, evaluate_full_layer, kernel_weights, StepDiagnostic};
use crate::error::Result;
use crate::feature_map::{generate_input_grid, SourceImage};
use crate::geometry::{
    display_to_input_cell, input_cell_to_output_cell, output_cell_rect, output_cell_to_receptive_field, CellRect,
    DisplayRect, DEFAULT_DISPLAY_SIZE_PX,
};
use crate::grid::{Grid, OutputGrid};
use crate::model::{LayerCatalog, LayerConfig, ParamOverlay, ParamsUpdate, SessionParams};

pub const MAX_SPEED: u32 = 1000;
/// Speed giving the 100 ms delay the simulator starts with.
pub const DEFAULT_SPEED: u32 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnimationState {
    /// Nothing focused yet.
    Idle,
    Playing,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Cursor {
    pub x: usize,
    pub y: usize,
}

/// Result of asking for one more cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum StepOutcome {
    Evaluated { x: usize, y: usize, value: f32 },
    /// Every cell has been stepped; nothing was done.
    Finished,
    /// Manual steps are ignored during playback.
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

/// Converts the speed control into the delay between automatic steps.
pub fn step_delay_for_speed(speed: u32) -> Duration {
    Duration::from_millis(u64::from(MAX_SPEED.saturating_sub(speed)))
}

#[derive(Debug, Clone)]
pub struct EngineSession {
    catalog: LayerCatalog,
    layer_index: usize,
    overlay: ParamOverlay,
    params: SessionParams,
    source: Option<SourceImage>,
    input: Grid,
    output: OutputGrid,
    cursor: Cursor,
    state: AnimationState,
    step_delay: Duration,
    since_last_step: Duration,
    diagnostic: Option<StepDiagnostic>,
    display_size_px: f32,
}

impl EngineSession {
    /// Prepares layer 0 of `catalog` without focusing it; the session starts `Idle`.
    pub fn new(catalog: LayerCatalog) -> Result<Self> {
        catalog.validate()?;
        let layer = catalog.get(0)?;
        let params = SessionParams::from_layer(layer);
        let output_dim = params.output_dim_for(layer.input_dim)?;
        let input = generate_input_grid(layer, None);
        Ok(Self {
            layer_index: 0,
            overlay: ParamOverlay::CatalogDefaults,
            params,
            source: None,
            input,
            output: OutputGrid::unset(output_dim),
            cursor: Cursor::default(),
            state: AnimationState::Idle,
            step_delay: step_delay_for_speed(DEFAULT_SPEED),
            since_last_step: Duration::ZERO,
            diagnostic: None,
            display_size_px: DEFAULT_DISPLAY_SIZE_PX,
            catalog,
        })
    }

    pub fn with_display_size(mut self, display_size_px: f32) -> Self {
        self.display_size_px = display_size_px;
        self
    }

    // ---- observable state ----

    pub fn catalog(&self) -> &LayerCatalog {
        &self.catalog
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn current_layer(&self) -> &LayerConfig {
        &self.catalog.layers[self.layer_index]
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// True when the user has overridden the catalog defaults for this layer.
    pub fn params_overridden(&self) -> bool {
        self.overlay.is_overridden()
    }

    pub fn source(&self) -> Option<&SourceImage> {
        self.source.as_ref()
    }

    pub fn input(&self) -> &Grid {
        &self.input
    }

    pub fn output(&self) -> &OutputGrid {
        &self.output
    }

    pub fn output_dim(&self) -> usize {
        self.output.dim()
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn state(&self) -> AnimationState {
        self.state
    }

    pub fn step_delay(&self) -> Duration {
        self.step_delay
    }

    pub fn display_size_px(&self) -> f32 {
        self.display_size_px
    }

    pub fn last_diagnostic(&self) -> Option<&StepDiagnostic> {
        self.diagnostic.as_ref()
    }

    /// The weights the arithmetic really uses for the current kernel size.
    pub fn kernel_weights(&self) -> Vec<Vec<f32>> {
        kernel_weights(self.params.kernel_size)
    }

    /// The input window feeding the cell under the cursor.
    pub fn receptive_field(&self) -> CellRect {
        output_cell_to_receptive_field(
            self.cursor.x,
            self.cursor.y,
            self.params.stride,
            self.params.padding,
            self.params.kernel_size,
        )
    }

    pub fn receptive_field_display(&self) -> DisplayRect {
        self.receptive_field().to_display(self.display_size_px, self.input.dim())
    }

    pub fn highlight_display(&self) -> DisplayRect {
        output_cell_rect(self.cursor.x, self.cursor.y).to_display(self.display_size_px, self.output.dim())
    }

    pub fn has_previous(&self) -> bool {
        self.layer_index > 0
    }

    pub fn has_next(&self) -> bool {
        self.layer_index + 1 < self.catalog.len()
    }

    // ---- focus and inputs ----

    /// Focuses a layer, dropping any parameter overrides and animation progress.
    /// An out-of-range index is rejected and the current state is kept.
    pub fn focus_layer(&mut self, index: isize) -> Result<()> {
        let layer = self.catalog.get(index)?;
        let params = SessionParams::from_layer(layer);
        let output_dim = params.output_dim_for(layer.input_dim)?;
        let input = generate_input_grid(layer, self.source.as_ref());
        info!(layer = index, name = %layer.name, "focused layer");

        self.layer_index = index as usize;
        self.overlay = ParamOverlay::CatalogDefaults;
        self.params = params;
        self.input = input;
        self.reset_animation(output_dim);
        Ok(())
    }

    pub fn focus_next(&mut self) -> Result<()> {
        self.focus_layer(self.layer_index as isize + 1)
    }

    pub fn focus_previous(&mut self) -> Result<()> {
        self.focus_layer(self.layer_index as isize - 1)
    }

    /// Back to the first layer.
    pub fn reset(&mut self) -> Result<()> {
        self.focus_layer(0)
    }

    /// Replaces the source image and refocuses the current layer.
    pub fn set_source_image(&mut self, source: SourceImage) -> Result<()> {
        self.source = Some(source);
        self.focus_layer(self.layer_index as isize)
    }

    pub fn clear_source_image(&mut self) -> Result<()> {
        self.source = None;
        self.focus_layer(self.layer_index as isize)
    }

    /// Overrides parameters of the focused layer. A change that would leave no
    /// output cells is rejected and the previous parameters stay active.
    pub fn set_session_params(&mut self, update: &ParamsUpdate) -> Result<()> {
        let candidate = self.params.with_update(update);
        let output_dim = match candidate.output_dim_for(self.current_layer().input_dim) {
            Ok(dim) => dim,
            Err(err) => {
                warn!(%err, "rejected parameter change");
                return Err(err);
            }
        };
        debug!(?candidate, output_dim, "session parameters changed");
        self.overlay = ParamOverlay::Session(candidate);
        self.params = self.overlay.resolve(&self.catalog.layers[self.layer_index]);
        self.reset_animation(output_dim);
        Ok(())
    }

    pub fn toggle_activation(&mut self) -> Result<()> {
        let update = ParamsUpdate { activation: Some(self.params.activation.toggled()), ..Default::default() };
        self.set_session_params(&update)
    }

    pub fn set_speed(&mut self, speed: u32) {
        self.step_delay = step_delay_for_speed(speed);
    }

    fn reset_animation(&mut self, output_dim: usize) {
        self.output = OutputGrid::unset(output_dim);
        self.cursor = Cursor::default();
        self.state = AnimationState::Paused;
        self.since_last_step = Duration::ZERO;
        self.diagnostic = None;
        debug!(output_dim, "animation reset");
    }

    // ---- stepping ----

    /// Manual step: evaluates the cell under the cursor and moves on in row-major order.
    pub fn step(&mut self) -> StepOutcome {
        match self.state {
            AnimationState::Idle => StepOutcome::Idle,
            AnimationState::Playing => StepOutcome::Busy,
            AnimationState::Finished => StepOutcome::Finished,
            AnimationState::Paused => self.advance_cursor(),
        }
    }

    fn advance_cursor(&mut self) -> StepOutcome {
        let dim = self.output.dim();
        if self.cursor.y >= dim {
            self.mark_finished();
            return StepOutcome::Finished;
        }
        let Cursor { x, y } = self.cursor;
        let value = self.evaluate_into_output(x, y);

        self.cursor.x += 1;
        if self.cursor.x >= dim {
            self.cursor.x = 0;
            self.cursor.y += 1;
        }
        if self.cursor.y >= dim {
            self.mark_finished();
        }
        StepOutcome::Evaluated { x, y, value }
    }

    fn mark_finished(&mut self) {
        if self.state != AnimationState::Finished {
            debug!(layer = self.layer_index, "layer finished");
        }
        self.state = AnimationState::Finished;
        self.since_last_step = Duration::ZERO;
    }

    fn evaluate_into_output(&mut self, x: usize, y: usize) -> f32 {
        let diagnostic = evaluate_cell(&self.input, &self.params, self.current_layer().bias, x, y);
        let value = diagnostic.result;
        self.output.set(x, y, value);
        self.diagnostic = Some(diagnostic);
        value
    }

    /// Starts or pauses playback. Starting evaluates one cell right away.
    pub fn toggle_play(&mut self) -> AnimationState {
        match self.state {
            AnimationState::Paused => {
                self.state = AnimationState::Playing;
                self.since_last_step = Duration::ZERO;
                debug!(delay_ms = self.step_delay.as_millis() as u64, "playback started");
                self.advance_cursor();
            }
            AnimationState::Playing => {
                self.state = AnimationState::Paused;
                debug!("playback paused");
            }
            AnimationState::Idle | AnimationState::Finished => {}
        }
        self.state
    }

    /// Feeds elapsed wall time to the playback timer and returns how many cells
    /// were evaluated. A zero delay evaluates exactly one cell per call.
    pub fn advance(&mut self, elapsed: Duration) -> usize {
        if self.state != AnimationState::Playing {
            return 0;
        }
        if self.step_delay.is_zero() {
            self.advance_cursor();
            return 1;
        }
        self.since_last_step += elapsed;
        let mut steps = 0;
        while self.state == AnimationState::Playing && self.since_last_step >= self.step_delay {
            self.since_last_step -= self.step_delay;
            self.advance_cursor();
            steps += 1;
        }
        steps
    }

    /// Evaluates every remaining cell at once and parks the cursor past the end.
    pub fn finish_layer(&mut self) -> Result<()> {
        if self.state == AnimationState::Idle {
            return Ok(());
        }
        let bias = self.current_layer().bias;
        let output = evaluate_full_layer(&self.input, &self.params, bias)?;
        let dim = output.dim();
        self.diagnostic = Some(evaluate_cell(&self.input, &self.params, bias, dim - 1, dim - 1));
        self.output = output;
        self.cursor = Cursor { x: 0, y: dim };
        self.mark_finished();
        Ok(())
    }

    // ---- probing ----

    /// Evaluates the single output cell `(ox, oy)` and moves the cursor there.
    /// Cells outside the output grid are ignored.
    pub fn probe_output_cell(&mut self, ox: usize, oy: usize) -> Option<f32> {
        let dim = self.output.dim();
        if self.state == AnimationState::Idle || ox >= dim || oy >= dim {
            return None;
        }
        self.cursor = Cursor { x: ox, y: oy };
        Some(self.evaluate_into_output(ox, oy))
    }

    /// Probes from a pointer position on the input canvas.
    pub fn probe_at(&mut self, pointer_x: f32, pointer_y: f32) -> Option<f32> {
        let (ix, iy) = display_to_input_cell(pointer_x, pointer_y, self.display_size_px, self.input.dim())?;
        let (ox, oy) = input_cell_to_output_cell(ix, iy, self.params.stride, self.output.dim())?;
        self.probe_output_cell(ox, oy)
    }

    /// Keyboard navigation: one cell in `direction`, clamped to the output grid.
    pub fn move_cursor(&mut self, direction: Direction) -> Option<f32> {
        let last = self.output.dim().saturating_sub(1);
        let Cursor { mut x, mut y } = self.cursor;
        match direction {
            Direction::Left => x = x.saturating_sub(1),
            Direction::Right => x += 1,
            Direction::Up => y = y.saturating_sub(1),
            Direction::Down => y += 1,
        }
        self.probe_output_cell(x.min(last), y.min(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use crate::model::Activation;
    use approx::assert_abs_diff_eq;

    fn focused(index: isize) -> EngineSession {
        let mut session = EngineSession::new(LayerCatalog::builtin()).expect("builtin catalog");
        session.focus_layer(index).expect("valid layer");
        session
    }

    #[test]
    fn starts_idle_and_ignores_stepping() {
        let mut session = EngineSession::new(LayerCatalog::builtin()).expect("builtin catalog");
        assert_eq!(session.state(), AnimationState::Idle);
        assert_eq!(session.step(), StepOutcome::Idle);
        assert_eq!(session.toggle_play(), AnimationState::Idle);
        assert_eq!(session.probe_output_cell(0, 0), None);
    }

    #[test]
    fn focus_pauses_at_origin_with_cleared_output() {
        let session = focused(3);
        assert_eq!(session.state(), AnimationState::Paused);
        assert_eq!(session.cursor(), Cursor { x: 0, y: 0 });
        assert_eq!(session.output_dim(), 16);
        assert_eq!(session.output().filled_count(), 0);
        assert_eq!(session.input().dim(), 16);
    }

    #[test]
    fn invalid_focus_keeps_prior_state() {
        let mut session = focused(2);
        session.step();
        assert!(matches!(session.focus_layer(6), Err(SimError::InvalidLayerIndex { .. })));
        assert_eq!(session.layer_index(), 2);
        assert_eq!(session.cursor(), Cursor { x: 1, y: 0 });
    }

    #[test]
    fn previous_from_first_layer_is_rejected() {
        let mut session = focused(0);
        assert!(!session.has_previous());
        assert!(session.focus_previous().is_err());
        assert!(session.focus_next().is_ok());
        assert_eq!(session.layer_index(), 1);
    }

    #[test]
    fn step_moves_row_major() {
        let mut session = focused(4);
        for _ in 0..8 {
            assert!(matches!(session.step(), StepOutcome::Evaluated { .. }));
        }
        assert_eq!(session.cursor(), Cursor { x: 0, y: 1 });
        assert_eq!(session.output().filled_count(), 8);
    }

    #[test]
    fn zero_input_first_cell_is_scaled_bias() {
        let mut session = focused(0);
        match session.step() {
            StepOutcome::Evaluated { x: 0, y: 0, value } => assert_abs_diff_eq!(value, 25.5, epsilon = 1e-4),
            other => panic!("unexpected outcome {other:?}"),
        }
        let diag = session.last_diagnostic().expect("diagnostic");
        assert_eq!(diag.bias_text(), "25.5");
        assert_eq!(diag.terms.len(), 25);
    }

    #[test]
    fn stepping_past_the_end_reports_finished() {
        let mut session = focused(5);
        let cells = 8 * 8;
        for _ in 0..cells {
            session.step();
        }
        assert_eq!(session.state(), AnimationState::Finished);
        assert_eq!(session.step(), StepOutcome::Finished);
        assert!(session.output().is_complete());
    }

    #[test]
    fn playback_steps_on_the_timer() {
        let mut session = focused(4);
        session.set_speed(900);
        assert_eq!(session.step_delay(), Duration::from_millis(100));
        assert_eq!(session.toggle_play(), AnimationState::Playing);
        assert_eq!(session.output().filled_count(), 1);
        assert_eq!(session.step(), StepOutcome::Busy);

        assert_eq!(session.advance(Duration::from_millis(50)), 0);
        assert_eq!(session.advance(Duration::from_millis(260)), 3);
        assert_eq!(session.output().filled_count(), 4);

        assert_eq!(session.toggle_play(), AnimationState::Paused);
        assert_eq!(session.advance(Duration::from_secs(5)), 0);
    }

    #[test]
    fn playback_stops_when_the_grid_is_full() {
        let mut session = focused(5);
        session.set_speed(2000);
        assert!(session.step_delay().is_zero());
        session.toggle_play();
        let mut calls = 0;
        while session.state() == AnimationState::Playing {
            session.advance(Duration::from_millis(16));
            calls += 1;
        }
        assert_eq!(calls, 63);
        assert_eq!(session.state(), AnimationState::Finished);
        assert_eq!(session.toggle_play(), AnimationState::Finished);
    }

    #[test]
    fn finish_fills_everything_and_parks_cursor() {
        let mut session = focused(2);
        session.step();
        session.finish_layer().expect("finish");
        assert_eq!(session.state(), AnimationState::Finished);
        assert_eq!(session.cursor(), Cursor { x: 0, y: 16 });
        assert!(session.output().is_complete());
        assert_eq!(session.last_diagnostic().map(|d| d.cell), Some((15, 15)));
    }

    #[test]
    fn param_change_resets_progress() {
        let mut session = focused(0);
        session.toggle_play();
        session.advance(Duration::from_millis(500));
        session
            .set_session_params(&ParamsUpdate { stride: Some(2), ..Default::default() })
            .expect("valid stride");
        assert_eq!(session.state(), AnimationState::Paused);
        assert_eq!(session.cursor(), Cursor::default());
        assert_eq!(session.output().filled_count(), 0);
        assert_eq!(session.output_dim(), 16);
        assert!(session.params_overridden());
    }

    #[test]
    fn degenerate_params_are_rejected() {
        let mut session = focused(4);
        session.step();
        let err = session
            .set_session_params(&ParamsUpdate { kernel_size: Some(11), padding: Some(0), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, SimError::DegenerateOutputDimension { input_dim: 8, kernel_size: 11, .. }));
        assert_eq!(session.params().kernel_size, 3);
        assert_eq!(session.cursor(), Cursor { x: 1, y: 0 });
        assert!(!session.params_overridden());
    }

    #[test]
    fn overrides_are_dropped_on_refocus() {
        let mut session = focused(1);
        session.toggle_activation().expect("toggle");
        assert_eq!(session.params().activation, Activation::Linear);
        session.focus_layer(1).expect("refocus");
        assert_eq!(session.params().activation, Activation::Relu);
        assert!(!session.params_overridden());
    }

    #[test]
    fn probe_evaluates_only_the_target_cell() {
        let mut session = focused(0);
        assert!(session.probe_output_cell(10, 4).is_some());
        assert_eq!(session.cursor(), Cursor { x: 10, y: 4 });
        assert_eq!(session.output().filled_count(), 1);
        assert_eq!(session.probe_output_cell(32, 0), None);
        assert_eq!(session.cursor(), Cursor { x: 10, y: 4 });
    }

    #[test]
    fn pointer_probe_maps_through_stride() {
        let mut session = focused(0);
        session
            .set_session_params(&ParamsUpdate { stride: Some(2), ..Default::default() })
            .expect("valid stride");
        // 300 px over 32 cells: x=100 is input column 10, output column 5.
        assert!(session.probe_at(100.0, 20.0).is_some());
        assert_eq!(session.cursor(), Cursor { x: 5, y: 1 });
        assert_eq!(session.probe_at(-3.0, 20.0), None);
    }

    #[test]
    fn arrow_keys_clamp_to_the_grid() {
        let mut session = focused(4);
        session.move_cursor(Direction::Left);
        assert_eq!(session.cursor(), Cursor { x: 0, y: 0 });
        for _ in 0..20 {
            session.move_cursor(Direction::Down);
        }
        assert_eq!(session.cursor(), Cursor { x: 0, y: 7 });
        session.finish_layer().expect("finish");
        session.move_cursor(Direction::Right);
        assert_eq!(session.cursor(), Cursor { x: 1, y: 7 });
        assert_eq!(session.state(), AnimationState::Finished);
    }

    #[test]
    fn rectangles_follow_the_cursor() {
        let mut session = focused(0);
        assert_eq!(session.receptive_field(), CellRect { left: -2, top: -2, size: 5 });
        session.probe_output_cell(3, 1);
        assert_eq!(session.receptive_field(), CellRect { left: 1, top: -1, size: 5 });
        let scale = 300.0 / 32.0;
        let hl = session.highlight_display();
        assert_abs_diff_eq!(hl.left, 3.0 * scale, epsilon = 1e-4);
        assert_abs_diff_eq!(hl.width, scale, epsilon = 1e-4);
    }
}
