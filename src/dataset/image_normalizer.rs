//! Image normalization for downloaded posts
//!
//! This module provides functionality for:
//! 1. Flattening transparent images onto an opaque background
//! 2. Rebuilding images from raw samples so no container metadata survives
//! 3. Capping the pixel count while keeping the aspect ratio
//! 4. Encoding to a lossless target format

use std::io::Cursor;
use std::path::Path;

use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{
    DynamicImage, GenericImageView, ImageBuffer, Pixel, Rgb, Rgb32FImage, RgbImage, Rgba32FImage,
};
use thiserror::Error;
use tracing::debug;

use crate::dataset::SpiderConfig;
use crate::dataset::config_loader::ConfigResult;

/// Error types for image normalization
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Decode error: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Encode error: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Pixel buffer error: {0}")]
    Buffer(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Result type for normalization operations
pub type NormalizeResult<T> = Result<T, NormalizeError>;

/// Lossless formats images can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Png,
    WebP,
    Tiff,
}

impl TargetFormat {
    /// Parses the config value; lossy formats are not accepted.
    pub fn from_config_string(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "png" => Some(TargetFormat::Png),
            "webp" => Some(TargetFormat::WebP),
            "tif" | "tiff" => Some(TargetFormat::Tiff),
            _ => None,
        }
    }

    /// Format of an existing file, judged by its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_config_string)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Png => "png",
            TargetFormat::WebP => "webp",
            TargetFormat::Tiff => "tiff",
        }
    }
}

/// Decodes, cleans, downsizes and encodes post images.
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    max_pixels: u64,
    format: TargetFormat,
    background: Rgb<u8>,
}

impl ImageNormalizer {
    pub fn new(max_pixels: u64, format: TargetFormat) -> Self {
        Self {
            max_pixels,
            format,
            background: Rgb([255, 255, 255]),
        }
    }

    pub fn from_config(config: &SpiderConfig) -> ConfigResult<Self> {
        Ok(Self::new(config.max_res, config.format()?))
    }

    pub fn format(&self) -> TargetFormat {
        self.format
    }

    /// Runs the whole pipeline on fetched bytes.
    pub fn normalize(&self, raw_bytes: &[u8]) -> NormalizeResult<DynamicImage> {
        let image = decode(raw_bytes)?;
        let (width, height) = image.dimensions();

        let image = flatten_transparency(image, self.background);
        let image = strip_metadata(&image)?;
        let image = cap_resolution(image, self.max_pixels);

        debug!(
            from = %format!("{}x{}", width, height),
            to = %format!("{}x{}", image.width(), image.height()),
            "Normalized image"
        );
        Ok(image)
    }

    /// Normalizes and encodes in the target format.
    pub fn normalize_to_bytes(&self, raw_bytes: &[u8]) -> NormalizeResult<Vec<u8>> {
        let image = self.normalize(raw_bytes)?;
        encode_lossless(&image, self.format)
    }
}

pub fn decode(raw_bytes: &[u8]) -> NormalizeResult<DynamicImage> {
    image::load_from_memory(raw_bytes).map_err(NormalizeError::Decode)
}

/// Whether any pixel is less than fully opaque.
pub fn has_transparency(image: &DynamicImage) -> bool {
    if !image.color().has_alpha() {
        return false;
    }
    match image {
        DynamicImage::ImageLumaA8(buf) => buf.pixels().any(|p| p.0[1] < u8::MAX),
        DynamicImage::ImageRgba8(buf) => buf.pixels().any(|p| p.0[3] < u8::MAX),
        DynamicImage::ImageLumaA16(buf) => buf.pixels().any(|p| p.0[1] < u16::MAX),
        DynamicImage::ImageRgba16(buf) => buf.pixels().any(|p| p.0[3] < u16::MAX),
        DynamicImage::ImageRgba32F(buf) => buf.pixels().any(|p| p.0[3] < 1.0),
        other => other.to_rgba8().pixels().any(|p| p.0[3] < u8::MAX),
    }
}

/// Composites a partly transparent image over `background`.
///
/// Images without non-opaque pixels are returned unchanged. The result of a
/// flatten never has an alpha channel; 16-bit and float sources keep 16-bit depth.
pub fn flatten_transparency(image: DynamicImage, background: Rgb<u8>) -> DynamicImage {
    if !has_transparency(&image) {
        return image;
    }

    let (width, height) = image.dimensions();
    let high_depth = matches!(
        image,
        DynamicImage::ImageLumaA16(_) | DynamicImage::ImageRgba16(_) | DynamicImage::ImageRgba32F(_)
    );

    if high_depth {
        let source = image.to_rgba16();
        let bg = background.0.map(|c| c as u32 * 257);
        let flat = ImageBuffer::from_fn(width, height, |x, y| {
            let [r, g, b, a] = source.get_pixel(x, y).0;
            Rgb([
                blend(r as u32, bg[0], a as u32, u16::MAX as u32) as u16,
                blend(g as u32, bg[1], a as u32, u16::MAX as u32) as u16,
                blend(b as u32, bg[2], a as u32, u16::MAX as u32) as u16,
            ])
        });
        DynamicImage::ImageRgb16(flat)
    } else {
        let source = image.to_rgba8();
        let bg = background.0.map(u32::from);
        let flat: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            let [r, g, b, a] = source.get_pixel(x, y).0;
            Rgb([
                blend(r as u32, bg[0], a as u32, u8::MAX as u32) as u8,
                blend(g as u32, bg[1], a as u32, u8::MAX as u32) as u8,
                blend(b as u32, bg[2], a as u32, u8::MAX as u32) as u8,
            ])
        });
        DynamicImage::ImageRgb8(flat)
    }
}

fn blend(src: u32, bg: u32, alpha: u32, max: u32) -> u32 {
    let src = src as u64;
    let bg = bg as u64;
    let alpha = alpha as u64;
    let max = max as u64;
    ((src * alpha + bg * (max - alpha) + max / 2) / max) as u32
}

/// Copies the raw samples into a fresh image of the same color type.
pub fn strip_metadata(image: &DynamicImage) -> NormalizeResult<DynamicImage> {
    let stripped = match image {
        DynamicImage::ImageLuma8(buf) => DynamicImage::ImageLuma8(copy_samples(buf)?),
        DynamicImage::ImageLumaA8(buf) => DynamicImage::ImageLumaA8(copy_samples(buf)?),
        DynamicImage::ImageRgb8(buf) => DynamicImage::ImageRgb8(copy_samples(buf)?),
        DynamicImage::ImageRgba8(buf) => DynamicImage::ImageRgba8(copy_samples(buf)?),
        DynamicImage::ImageLuma16(buf) => DynamicImage::ImageLuma16(copy_samples(buf)?),
        DynamicImage::ImageLumaA16(buf) => DynamicImage::ImageLumaA16(copy_samples(buf)?),
        DynamicImage::ImageRgb16(buf) => DynamicImage::ImageRgb16(copy_samples(buf)?),
        DynamicImage::ImageRgba16(buf) => DynamicImage::ImageRgba16(copy_samples(buf)?),
        DynamicImage::ImageRgb32F(buf) => {
            let fresh: Rgb32FImage = copy_samples(buf)?;
            DynamicImage::ImageRgb32F(fresh)
        }
        DynamicImage::ImageRgba32F(buf) => {
            let fresh: Rgba32FImage = copy_samples(buf)?;
            DynamicImage::ImageRgba32F(fresh)
        }
        other => DynamicImage::ImageRgba8(copy_samples(&other.to_rgba8())?),
    };
    Ok(stripped)
}

fn copy_samples<P: Pixel>(
    buf: &ImageBuffer<P, Vec<P::Subpixel>>,
) -> NormalizeResult<ImageBuffer<P, Vec<P::Subpixel>>> {
    let (width, height) = buf.dimensions();
    ImageBuffer::from_raw(width, height, buf.as_raw().to_vec()).ok_or_else(|| {
        NormalizeError::Buffer(format!("sample buffer does not fit {}x{}", width, height))
    })
}

/// Dimensions after capping `width * height` at `max_pixels`.
///
/// Both sides are scaled by `sqrt(max_pixels / (width * height))` and rounded
/// down; images within the ceiling keep their size.
pub fn capped_dimensions(width: u32, height: u32, max_pixels: u64) -> (u32, u32) {
    let pixels = width as u64 * height as u64;
    if pixels <= max_pixels {
        return (width, height);
    }
    let ratio = (max_pixels as f64 / pixels as f64).sqrt();
    let scaled_width = ((width as f64 * ratio).floor() as u32).max(1);
    let scaled_height = ((height as f64 * ratio).floor() as u32).max(1);
    (scaled_width, scaled_height)
}

pub fn cap_resolution(image: DynamicImage, max_pixels: u64) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = capped_dimensions(width, height, max_pixels);
    if (new_width, new_height) == (width, height) {
        return image;
    }
    image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

/// Encodes with the lossless mode of `format` requested explicitly.
pub fn encode_lossless(image: &DynamicImage, format: TargetFormat) -> NormalizeResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());

    match format {
        TargetFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut buffer,
                CompressionType::Best,
                PngFilter::Adaptive,
            );
            to_integer_samples(image)
                .write_with_encoder(encoder)
                .map_err(NormalizeError::Encode)?;
        }
        TargetFormat::WebP => {
            let encoder = WebPEncoder::new_lossless(&mut buffer);
            let eight_bit = if image.color().has_alpha() {
                DynamicImage::ImageRgba8(image.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(image.to_rgb8())
            };
            eight_bit
                .write_with_encoder(encoder)
                .map_err(NormalizeError::Encode)?;
        }
        TargetFormat::Tiff => {
            let encoder = TiffEncoder::new(&mut buffer);
            to_integer_samples(image)
                .write_with_encoder(encoder)
                .map_err(NormalizeError::Encode)?;
        }
    }

    Ok(buffer.into_inner())
}

fn to_integer_samples(image: &DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(image.to_rgb16()),
        DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
        other => other.clone(),
    }
}
