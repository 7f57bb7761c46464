//! Derivative generation - turns original images into JPEG thumbnails
//!
//! One engine handles the whole chain: EXIF orientation correction, color
//! mode normalization, per-tier downscaling with aspect ratio preserved,
//! unsharp masking and JPEG encoding.
//!
//! Uses `spawn_blocking` for CPU-intensive operations to avoid blocking the
//! async runtime.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};
use tracing::debug;

use crate::config::DEFAULT_PRIMARY_CAP;
use crate::error::{Result, WorkerError};

/// Configuration for derivative generation
#[derive(Clone, Debug)]
pub struct DerivationConfig {
    /// Longest-side cap for the primary derivative, in pixels (0 falls back
    /// to the default cap)
    pub max_primary: u32,
    /// Longest-side cap for the secondary derivative, in pixels
    pub max_secondary: u32,
    /// Whether a secondary (retina) derivative is produced at all
    pub secondary_enabled: bool,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Unsharp mask strength (0-3, 0 disables sharpening)
    pub sharpen_level: u8,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            max_primary: DEFAULT_PRIMARY_CAP,
            max_secondary: 0,
            secondary_enabled: false,
            quality: 90,
            sharpen_level: 2,
        }
    }
}

impl DerivationConfig {
    /// Clamp tunables into their documented ranges
    pub fn normalized(mut self) -> Self {
        self.quality = self.quality.clamp(1, 100);
        self.sharpen_level = self.sharpen_level.min(3);
        self
    }
}

/// A single encoded derivative
#[derive(Clone, Debug)]
pub struct Derivative {
    /// JPEG data
    pub data: Bytes,
    /// Width of the derivative
    pub width: u32,
    /// Height of the derivative
    pub height: u32,
}

/// Primary and optional secondary derivatives for one source image
#[derive(Clone, Debug)]
pub struct DerivedSet {
    pub primary: Derivative,
    pub secondary: Option<Derivative>,
}

/// Derivative engine
pub struct DerivationEngine {
    config: DerivationConfig,
}

impl DerivationEngine {
    /// Create a new engine with the given configuration
    pub fn new(config: DerivationConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    /// Whether the configuration yields a secondary derivative
    pub fn secondary_enabled(&self) -> bool {
        self.config.secondary_enabled && self.config.max_secondary > 0
    }

    /// Generate derivatives from the given source bytes (blocking version)
    ///
    /// **Note:** This method performs CPU-intensive operations and should not
    /// be called directly from async code. Use `derive_async` instead.
    pub fn derive(&self, source: &[u8]) -> Result<DerivedSet> {
        // Decode the image
        let img = image::load_from_memory(source)
            .map_err(|e| WorkerError::Processing(format!("Failed to decode image: {e}")))?;

        let (orig_w, orig_h) = img.dimensions();
        debug!(
            original_width = orig_w,
            original_height = orig_h,
            "Processing source image"
        );

        // Honor camera rotation before anything looks at dimensions
        let img = apply_orientation(img, orientation_from_bytes(source));

        // Grayscale sources stay grayscale, everything else becomes 8-bit RGB
        let img = normalize_mode(img);

        let primary_cap = if self.config.max_primary == 0 {
            DEFAULT_PRIMARY_CAP
        } else {
            self.config.max_primary
        };
        let primary = self.derive_tier(&img, primary_cap)?;

        let secondary = if self.secondary_enabled() {
            Some(self.derive_tier(&img, self.config.max_secondary)?)
        } else {
            None
        };

        Ok(DerivedSet { primary, secondary })
    }

    /// Generate derivatives asynchronously using a blocking thread pool
    pub async fn derive_async(self: Arc<Self>, source: Bytes) -> Result<DerivedSet> {
        let engine = self.clone();

        tokio::task::spawn_blocking(move || engine.derive(&source))
            .await
            .map_err(|e| WorkerError::Processing(format!("Derivation task panicked: {e}")))?
    }

    /// Produce one derivative capped at `cap` on the longest side
    fn derive_tier(&self, img: &DynamicImage, cap: u32) -> Result<Derivative> {
        let (width, height) = img.dimensions();

        // Never upscale: sources within the cap are re-encoded as-is
        let scaled = if width <= cap && height <= cap {
            img.clone()
        } else {
            let (new_w, new_h) = scaled_dimensions(width, height, cap);
            img.resize_exact(new_w.max(1), new_h.max(1), FilterType::Lanczos3)
        };

        let sharpened = sharpen(scaled, self.config.sharpen_level);
        let data = encode_jpeg(&sharpened, self.config.quality)?;

        debug!(
            width = sharpened.width(),
            height = sharpened.height(),
            size = data.len(),
            cap,
            "Derivative generated"
        );

        Ok(Derivative {
            width: sharpened.width(),
            height: sharpened.height(),
            data: Bytes::from(data),
        })
    }
}

/// Calculate new dimensions so the longest side equals `cap`, maintaining
/// aspect ratio
fn scaled_dimensions(width: u32, height: u32, cap: u32) -> (u32, u32) {
    if width > height {
        let ratio = cap as f32 / width as f32;
        (cap, ((height as f32) * ratio).round() as u32)
    } else {
        let ratio = cap as f32 / height as f32;
        (((width as f32) * ratio).round() as u32, cap)
    }
}

/// Read the EXIF orientation tag from the raw source bytes.
///
/// Missing or unreadable metadata counts as the identity orientation.
fn orientation_from_bytes(source: &[u8]) -> u32 {
    let mut cursor = Cursor::new(source);
    match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(meta) => meta
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    }
}

/// Apply the flip or rotation an EXIF orientation value (1-8) calls for
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Match the encoder's expectations: L8 stays single-channel, everything
/// else becomes RGB8
fn normalize_mode(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// Unsharp mask parameters (sigma, threshold) per sharpen level. Higher
/// levels widen the radius and lower the threshold.
fn sharpen_params(level: u8) -> Option<(f32, i32)> {
    match level {
        1 => Some((0.6, 4)),
        2 => Some((1.0, 3)),
        3 => Some((1.6, 2)),
        _ => None,
    }
}

/// Apply the unsharp mask for the given level after scaling
fn sharpen(img: DynamicImage, level: u8) -> DynamicImage {
    match sharpen_params(level) {
        Some((sigma, threshold)) => img.unsharpen(sigma, threshold),
        None => img,
    }
}

/// Encode as JPEG: progressive scan, optimized coding tables, 4:4:4 sampling
fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let width = dimension_u16(img.width())?;
    let height = dimension_u16(img.height())?;

    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf, quality);
    encoder.set_progressive(true);
    encoder.set_optimized_huffman_tables(true);
    encoder.set_sampling_factor(SamplingFactor::F_1_1);

    match img {
        DynamicImage::ImageLuma8(gray) => encoder
            .encode(gray.as_raw(), width, height, ColorType::Luma)
            .map_err(|e| WorkerError::Processing(format!("Failed to encode JPEG: {e}")))?,
        other => {
            let rgb = other.to_rgb8();
            encoder
                .encode(rgb.as_raw(), width, height, ColorType::Rgb)
                .map_err(|e| WorkerError::Processing(format!("Failed to encode JPEG: {e}")))?
        }
    }

    Ok(buf)
}

fn dimension_u16(value: u32) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| WorkerError::Processing(format!("Dimension {value} exceeds JPEG limits")))
}
