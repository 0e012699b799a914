use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::Result;
use crate::geometry::DEFAULT_DISPLAY_SIZE_PX;
use crate::model::LayerCatalog;
use crate::session::DEFAULT_SPEED;

/// Settings for the desktop viewer, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub display_size_px: f32,
    /// Playback speed in `0..=1000`; the step delay is `1000 - speed` ms.
    pub speed: u32,
    /// Optional JSON file replacing the built-in layer catalog.
    pub catalog_path: Option<PathBuf>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            display_size_px: DEFAULT_DISPLAY_SIZE_PX,
            speed: DEFAULT_SPEED,
            catalog_path: None,
        }
    }
}

impl ViewerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The catalog named by `catalog_path`, or the built-in one.
    pub fn catalog(&self) -> Result<LayerCatalog> {
        match &self.catalog_path {
            Some(path) => LayerCatalog::from_json(&fs::read_to_string(path)?),
            None => Ok(LayerCatalog::builtin()),
        }
    }
}

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber. Honours `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() -> std::result::Result<(), InitError> {
    INITIALISED.set(()).map_err(|_| InitError::AlreadyInitialised)?;

    let ansi = std::io::stdout().is_terminal();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_ansi(ansi);
    Registry::default().with(filter).with(fmt_layer).init();
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
}
