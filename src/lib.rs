//! Layer simulation engine for a step-by-step convolution walkthrough.
//!
//! A fixed six-layer catalog is explored one layer at a time: the focused
//! layer's input grid is generated from a source image, and its output grid is
//! revealed cell by cell through [`session::EngineSession`].

pub mod config;
pub mod conv;
pub mod error;
pub mod feature_map;
pub mod geometry;
pub mod grid;
pub mod model;
pub mod session;

pub use conv::{evaluate_cell, evaluate_full_layer, output_dim, StepDiagnostic, Term};
pub use error::{Result, SimError};
pub use feature_map::{generate_input_grid, SourceImage};
pub use grid::{Grid, OutputGrid};
pub use model::{Activation, LayerCatalog, LayerConfig, ParamsUpdate, PoolMode, SessionParams};
pub use session::{AnimationState, Cursor, Direction, EngineSession, StepOutcome};
