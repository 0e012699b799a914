//! Input grids for each layer.
//!
//! Layer 0 sees the real luminance of the source image. Deeper layers do not
//! run a network: they re-derive a grayscale map from the original source
//! through a depth-indexed chain of presentation filters, so the "feature map"
//! looks progressively more abstract while staying a pure function of
//! `(source, depth)`.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use tracing::{debug, warn};

use crate::error::{Result, SimError};
use crate::grid::Grid;
use crate::model::LayerConfig;

/// Side length every source image is resampled to on load.
pub const SOURCE_DIM: u32 = 32;

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// The RGB picture being convolved, held at `SOURCE_DIM x SOURCE_DIM`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImage {
    pixels: RgbaImage,
}

impl SourceImage {
    /// Wraps a raw RGBA8 buffer of `width * height * 4` bytes.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        let actual = data.len();
        let pixels = RgbaImage::from_raw(width, height, data).ok_or_else(|| {
            SimError::Config(format!(
                "pixel buffer of {actual} bytes does not match {width}x{height} RGBA ({expected} bytes)"
            ))
        })?;
        Ok(Self::from_rgba_image(&pixels))
    }

    pub fn from_rgba_image(pixels: &RgbaImage) -> Self {
        let pixels = if pixels.dimensions() == (SOURCE_DIM, SOURCE_DIM) {
            pixels.clone()
        } else {
            imageops::resize(pixels, SOURCE_DIM, SOURCE_DIM, FilterType::Triangle)
        };
        Self { pixels }
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        Self::from_rgba_image(&image.to_rgba8())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)?;
        debug!(path = %path.display(), width = image.width(), height = image.height(), "loaded source image");
        Ok(Self::from_image(&image))
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    fn resampled(&self, dim: usize) -> RgbaImage {
        let dim = dim as u32;
        if dim == SOURCE_DIM {
            self.pixels.clone()
        } else {
            imageops::resize(&self.pixels, dim, dim, FilterType::Triangle)
        }
    }
}

/// One step of the cosmetic filter chain applied to fake deeper feature maps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PresentationFilter {
    /// Multiplier around mid-gray, 1.0 leaves the image unchanged.
    Contrast(f32),
    Brightness(f32),
    HueRotate { degrees: f32 },
    /// Amount in `[0, 1]`.
    Grayscale(f32),
    Blur { sigma: f32 },
}

/// The chain for a given depth: contrast, brightness, hue, grayscale, then blur past depth 1.
pub fn filter_chain(depth: usize) -> Vec<PresentationFilter> {
    let d = depth as f32;
    let mut chain = vec![
        PresentationFilter::Contrast(1.0 + d * 0.2),
        PresentationFilter::Brightness(1.0 + d * 0.05),
        PresentationFilter::HueRotate { degrees: d * 60.0 },
        PresentationFilter::Grayscale(1.0),
    ];
    if depth > 1 {
        chain.push(PresentationFilter::Blur { sigma: d / 6.0 });
    }
    chain
}

/// A square RGB image with channels in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
struct RgbPlane {
    dim: usize,
    pixels: Vec<[f32; 3]>,
}

impl RgbPlane {
    fn from_rgba(image: &RgbaImage) -> Self {
        let pixels = image
            .pixels()
            .map(|p| [p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0])
            .collect();
        Self { dim: image.width() as usize, pixels }
    }

    fn map(&mut self, f: impl Fn([f32; 3]) -> [f32; 3]) {
        for px in &mut self.pixels {
            *px = f(*px).map(|c| c.clamp(0.0, 1.0));
        }
    }

    fn apply(&mut self, filter: PresentationFilter) {
        match filter {
            PresentationFilter::Contrast(amount) => self.map(|px| px.map(|c| (c - 0.5) * amount + 0.5)),
            PresentationFilter::Brightness(amount) => self.map(|px| px.map(|c| c * amount)),
            PresentationFilter::HueRotate { degrees } => {
                let m = hue_rotate_matrix(degrees);
                self.map(|px| mul3(&m, px));
            }
            PresentationFilter::Grayscale(amount) => {
                let m = grayscale_matrix(amount);
                self.map(|px| mul3(&m, px));
            }
            PresentationFilter::Blur { sigma } => self.blur(sigma),
        }
    }

    fn blur(&mut self, sigma: f32) {
        if sigma <= 0.0 {
            return;
        }
        let kernel = gaussian_kernel(sigma);
        let horizontal = self.convolve_1d(&kernel, true);
        *self = horizontal.convolve_1d(&kernel, false);
    }

    /// Separable pass with edge pixels repeated past the border.
    fn convolve_1d(&self, kernel: &[f32], horizontal: bool) -> Self {
        let dim = self.dim as i64;
        let half = (kernel.len() / 2) as i64;
        let mut pixels = vec![[0.0; 3]; self.pixels.len()];
        for y in 0..dim {
            for x in 0..dim {
                let mut acc = [0.0f32; 3];
                for (k, w) in kernel.iter().enumerate() {
                    let offset = k as i64 - half;
                    let (sx, sy) = if horizontal { (x + offset, y) } else { (x, y + offset) };
                    let src = self.pixels[(sy.clamp(0, dim - 1) * dim + sx.clamp(0, dim - 1)) as usize];
                    for c in 0..3 {
                        acc[c] += src[c] * w;
                    }
                }
                pixels[(y * dim + x) as usize] = acc.map(|c| c.clamp(0.0, 1.0));
            }
        }
        Self { dim: self.dim, pixels }
    }

    /// Quantizes the red channel back to 0..=255; after grayscale all channels agree.
    fn red_channel_grid(&self) -> Grid {
        Grid::from_fn(self.dim, |x, y| (self.pixels[y * self.dim + x][0] * 255.0).round())
    }
}

fn mul3(m: &[[f32; 3]; 3], px: [f32; 3]) -> [f32; 3] {
    [0, 1, 2].map(|row| m[row][0] * px[0] + m[row][1] * px[1] + m[row][2] * px[2])
}

fn hue_rotate_matrix(degrees: f32) -> [[f32; 3]; 3] {
    let (sin, cos) = degrees.to_radians().sin_cos();
    [
        [
            0.213 + cos * 0.787 - sin * 0.213,
            0.715 - cos * 0.715 - sin * 0.715,
            0.072 - cos * 0.072 + sin * 0.928,
        ],
        [
            0.213 - cos * 0.213 + sin * 0.143,
            0.715 + cos * 0.285 + sin * 0.140,
            0.072 - cos * 0.072 - sin * 0.283,
        ],
        [
            0.213 - cos * 0.213 - sin * 0.787,
            0.715 - cos * 0.715 + sin * 0.715,
            0.072 + cos * 0.928 + sin * 0.072,
        ],
    ]
}

fn grayscale_matrix(amount: f32) -> [[f32; 3]; 3] {
    let keep = 1.0 - amount.clamp(0.0, 1.0);
    [
        [0.2126 + 0.7874 * keep, 0.7152 - 0.7152 * keep, 0.0722 - 0.0722 * keep],
        [0.2126 - 0.2126 * keep, 0.7152 + 0.2848 * keep, 0.0722 - 0.0722 * keep],
        [0.2126 - 0.2126 * keep, 0.7152 - 0.7152 * keep, 0.0722 + 0.9278 * keep],
    ]
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as i32;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / two_sigma_sq).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

/// Luminance of `source` resampled to `dim`.
pub fn luminance_grid(source: &SourceImage, dim: usize) -> Grid {
    let pixels = source.resampled(dim);
    Grid::from_fn(dim, |x, y| {
        let p = pixels.get_pixel(x as u32, y as u32);
        LUMA_R * p[0] as f32 + LUMA_G * p[1] as f32 + LUMA_B * p[2] as f32
    })
}

/// Synthetic map for `depth > 0`, derived from the original source only.
pub fn pseudo_feature_grid(source: &SourceImage, dim: usize, depth: usize) -> Grid {
    let mut plane = RgbPlane::from_rgba(&source.resampled(dim));
    for filter in filter_chain(depth) {
        plane.apply(filter);
    }
    plane.red_channel_grid()
}

/// Builds the input grid of `layer`. With no source loaded this is a zero grid.
pub fn generate_input_grid(layer: &LayerConfig, source: Option<&SourceImage>) -> Grid {
    let Some(source) = source else {
        warn!(layer = layer.id, "no source image loaded, using an empty input grid");
        return Grid::zeros(layer.input_dim);
    };
    if layer.id == 0 {
        luminance_grid(source, layer.input_dim)
    } else {
        pseudo_feature_grid(source, layer.input_dim, layer.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LayerCatalog;
    use approx::assert_abs_diff_eq;

    fn gradient_source() -> SourceImage {
        let mut data = Vec::with_capacity(32 * 32 * 4);
        for y in 0..32u32 {
            for x in 0..32u32 {
                data.extend_from_slice(&[(x * 8) as u8, (y * 8) as u8, ((x + y) * 4) as u8, 255]);
            }
        }
        SourceImage::from_rgba(32, 32, data).expect("valid buffer")
    }

    #[test]
    fn first_layer_uses_weighted_luminance() {
        let data = [200u8, 100, 50, 255].repeat(32 * 32);
        let source = SourceImage::from_rgba(32, 32, data).expect("valid buffer");
        let layer = &LayerCatalog::builtin().layers[0];
        let grid = generate_input_grid(layer, Some(&source));
        assert_eq!(grid.dim(), 32);
        let expected: f32 = 0.299 * 200.0 + 0.587 * 100.0 + 0.114 * 50.0;
        for v in grid.values() {
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-3);
        }
    }

    #[test]
    fn missing_source_gives_zero_grid_of_input_dim() {
        let catalog = LayerCatalog::builtin();
        for layer in &catalog.layers {
            let grid = generate_input_grid(layer, None);
            assert_eq!(grid.dim(), layer.input_dim);
            assert!(grid.values().iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn deeper_maps_are_deterministic_and_sized() {
        let source = gradient_source();
        for layer in LayerCatalog::builtin().layers.iter().skip(1) {
            let a = generate_input_grid(layer, Some(&source));
            let b = generate_input_grid(layer, Some(&source));
            assert_eq!(a, b);
            assert_eq!(a.dim(), layer.input_dim);
            assert!(a.values().iter().all(|v| (0.0..=255.0).contains(v)));
        }
    }

    #[test]
    fn depth_changes_the_synthetic_map() {
        let source = gradient_source();
        assert_ne!(pseudo_feature_grid(&source, 16, 2), pseudo_feature_grid(&source, 16, 3));
    }

    #[test]
    fn chain_blurs_only_past_depth_one() {
        assert_eq!(filter_chain(1).len(), 4);
        let chain = filter_chain(3);
        assert_eq!(chain.len(), 5);
        assert_eq!(chain[0], PresentationFilter::Contrast(1.6));
        assert_eq!(chain[4], PresentationFilter::Blur { sigma: 0.5 });
    }

    #[test]
    fn identity_filters_leave_pixels_alone() {
        let m = hue_rotate_matrix(0.0);
        let px = mul3(&m, [0.2, 0.4, 0.6]);
        for (a, b) in px.iter().zip([0.2, 0.4, 0.6]) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-5);
        }
        let gray = mul3(&grayscale_matrix(1.0), [1.0, 0.0, 0.0]);
        assert_abs_diff_eq!(gray[0], gray[2], epsilon = 1e-6);
    }

    #[test]
    fn gaussian_kernel_is_normalized() {
        let kernel = gaussian_kernel(0.8);
        assert_eq!(kernel.len() % 2, 1);
        assert_abs_diff_eq!(kernel.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        assert!(matches!(SourceImage::from_rgba(4, 4, vec![0; 10]), Err(SimError::Config(_))));
    }

    #[test]
    fn large_images_are_resampled_to_source_dim() {
        let source = SourceImage::from_rgba(64, 48, vec![128; 64 * 48 * 4]).expect("valid buffer");
        assert_eq!(source.pixels().dimensions(), (SOURCE_DIM, SOURCE_DIM));
    }
}
