use serde::{Deserialize, Serialize};

use crate::conv::output_dim;
use crate::error::{Result, SimError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    None,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Linear,
}

impl Activation {
    pub fn toggled(self) -> Self {
        match self {
            Activation::Relu => Activation::Linear,
            Activation::Linear => Activation::Relu,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Activation::Relu => "ReLU",
            Activation::Linear => "Linear",
        }
    }
}

/// Operations a block is made of, shown as badges next to the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerOp {
    Conv,
    #[serde(rename = "ReLU")]
    Relu,
    Pool,
}

/// One hand-authored entry of the layer catalog. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub id: usize,
    pub name: String,
    pub input_channels: usize,
    pub output_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub pool: PoolMode,
    pub activation: Activation,
    pub ops: Vec<LayerOp>,
    pub input_dim: usize,
    /// Nominal output side; the simulated side comes from the session params.
    pub output_dim: usize,
    /// Informational only, never used in arithmetic.
    pub receptive_field: usize,
    /// Fraction of the 0..=255 intensity range, scaled by 255 when applied.
    pub bias: f32,
}

impl LayerConfig {
    /// The part of the name after the colon, e.g. "Textures".
    pub fn role(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, role)| role.trim())
            .filter(|role| !role.is_empty())
            .unwrap_or("Feature Extraction")
    }

    /// Width of the "global analysis" meter in percent.
    pub fn coverage_percent(&self) -> usize {
        (self.receptive_field * 3).min(100)
    }

    pub fn scaled_bias(&self) -> f32 {
        self.bias * 255.0
    }
}

/// The user-overridable subset of a layer's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub output_channels: usize,
    pub pool: PoolMode,
    pub activation: Activation,
}

impl SessionParams {
    pub fn from_layer(layer: &LayerConfig) -> Self {
        Self {
            kernel_size: layer.kernel_size,
            stride: layer.stride,
            padding: layer.padding,
            output_channels: layer.output_channels,
            pool: layer.pool,
            activation: layer.activation,
        }
    }

    /// Overlays the fields present in `update`, leaving the rest untouched.
    pub fn with_update(&self, update: &ParamsUpdate) -> Self {
        Self {
            kernel_size: update.kernel_size.unwrap_or(self.kernel_size),
            stride: update.stride.unwrap_or(self.stride),
            padding: update.padding.unwrap_or(self.padding),
            output_channels: update.output_channels.unwrap_or(self.output_channels),
            pool: update.pool.unwrap_or(self.pool),
            activation: update.activation.unwrap_or(self.activation),
        }
    }

    /// Output side length for an input of `input_dim`, rejecting degenerate shapes.
    pub fn output_dim_for(&self, input_dim: usize) -> Result<usize> {
        output_dim(input_dim, self.kernel_size, self.stride, self.padding)
    }
}

/// A partial parameter change coming from the controls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsUpdate {
    pub kernel_size: Option<usize>,
    pub stride: Option<usize>,
    pub padding: Option<usize>,
    pub output_channels: Option<usize>,
    pub pool: Option<PoolMode>,
    pub activation: Option<Activation>,
}

/// Where the active parameters of the focused layer come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOverlay {
    CatalogDefaults,
    Session(SessionParams),
}

impl ParamOverlay {
    pub fn resolve(&self, layer: &LayerConfig) -> SessionParams {
        match self {
            ParamOverlay::CatalogDefaults => SessionParams::from_layer(layer),
            ParamOverlay::Session(params) => *params,
        }
    }

    pub fn is_overridden(&self) -> bool {
        matches!(self, ParamOverlay::Session(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCatalog {
    pub layers: Vec<LayerConfig>,
}

impl LayerCatalog {
    /// The six-block pipeline walked through by the simulator.
    pub fn builtin() -> Self {
        use Activation::Relu;
        use LayerOp::{Conv, Pool, Relu as ReluOp};

        let layer = |id: usize,
                     name: &str,
                     (input_channels, output_channels): (usize, usize),
                     (kernel_size, stride, padding): (usize, usize, usize),
                     pool: PoolMode,
                     (input_dim, output_dim): (usize, usize),
                     receptive_field: usize,
                     bias: f32| {
            let mut ops = vec![Conv, ReluOp];
            if pool == PoolMode::Avg {
                ops.push(Pool);
            }
            LayerConfig {
                id,
                name: name.to_string(),
                input_channels,
                output_channels,
                kernel_size,
                stride,
                padding,
                pool,
                activation: Relu,
                ops,
                input_dim,
                output_dim,
                receptive_field,
                bias,
            }
        };

        Self {
            layers: vec![
                layer(0, "Layer 0: Basic Features", (3, 64), (5, 1, 2), PoolMode::None, (32, 32), 5, 0.1),
                layer(1, "Layer 1: Textures", (64, 119), (5, 1, 2), PoolMode::Avg, (32, 16), 14, -0.2),
                layer(2, "Layer 2: Complex Patterns", (119, 221), (3, 1, 1), PoolMode::None, (16, 16), 24, 0.05),
                layer(3, "Layer 3: Parts (Wheels)", (221, 256), (5, 1, 2), PoolMode::Avg, (16, 8), 50, 0.1),
                layer(4, "Layer 4: Object Assembly", (256, 256), (3, 1, 1), PoolMode::None, (8, 8), 80, -0.1),
                layer(5, "Layer 5: Semantic Objects", (256, 256), (5, 1, 2), PoolMode::None, (8, 8), 120, 0.2),
            ],
        }
    }

    /// Parses and validates a catalog written as JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let catalog: LayerCatalog = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(SimError::Config("catalog has no layers".into()));
        }
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.id != index {
                return Err(SimError::Config(format!(
                    "layer at position {index} has id {}",
                    layer.id
                )));
            }
            if layer.input_dim == 0 {
                return Err(SimError::Config(format!("layer {index} has an empty input")));
            }
            SessionParams::from_layer(layer).output_dim_for(layer.input_dim)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: isize) -> Result<&LayerConfig> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.layers.get(i))
            .ok_or(SimError::InvalidLayerIndex { index, len: self.layers.len() })
    }
}

impl Default for LayerCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
