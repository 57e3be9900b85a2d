//! Upload decoding: format sniffing, sanity bounds, alpha flattening and
//! bounding-box downscale.

use crate::types::{Bitmap, SourceImage};
use image::imageops::{self, FilterType};
use image::error::LimitErrorKind;
use image::{DynamicImage, ImageError, ImageFormat, ImageReader, Limits, RgbImage};
use std::io::Cursor;
use thiserror::Error;

pub const DEFAULT_MAX_SIDE: u32 = 2200;
pub const DEFAULT_MIN_SIDE: u32 = 64;
pub const DEFAULT_MAX_SOURCE_SIDE: u32 = 8000;
pub const DEFAULT_MAX_DECODE_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty upload")]
    Empty,
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("unsupported image format: {0:?}")]
    Unsupported(ImageFormat),
    #[error("image exceeds {max}px per side")]
    TooLarge { max: u32 },
    #[error("decoding needs more than {max_bytes} bytes")]
    OverBudget { max_bytes: u64 },
    #[error("image is {width}x{height}, smaller than {min}px per side")]
    TooSmall { width: u32, height: u32, min: u32 },
    #[error("cannot decode image: {0}")]
    Malformed(String),
}

/// Dimension bounds applied while decoding.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    /// Smallest accepted side of the source image.
    pub min_side: u32,
    /// Largest accepted side of the source image, checked before pixel allocation.
    pub max_source_side: u32,
    /// Longest side of the decoded bitmap after downscaling.
    pub max_side: u32,
    /// Allocation budget of the decoder itself.
    pub max_decode_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            min_side: DEFAULT_MIN_SIDE,
            max_source_side: DEFAULT_MAX_SOURCE_SIDE,
            max_side: DEFAULT_MAX_SIDE,
            max_decode_bytes: DEFAULT_MAX_DECODE_BYTES,
        }
    }
}

impl DecodeLimits {
    /// Same bounds, but keep the source resolution: `max_side` is raised to
    /// `max_source_side`. Used where coordinates refer to source pixels.
    pub fn without_downscale(self) -> Self {
        Self {
            max_side: self.max_source_side,
            ..self
        }
    }
}

/// Turns uploaded bytes into a bounded RGB bitmap.
#[derive(Debug, Clone, Default)]
pub struct ImageDecoder {
    limits: DecodeLimits,
}

impl ImageDecoder {
    pub fn new(limits: DecodeLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &DecodeLimits {
        &self.limits
    }

    /// Decode `source` into a bitmap whose longest side is at most `max_side`.
    pub fn decode(&self, source: &SourceImage) -> Result<Bitmap, DecodeError> {
        if source.is_empty() {
            return Err(DecodeError::Empty);
        }

        let format = sniff_format(source)?;
        if !format.reading_enabled() {
            return Err(DecodeError::Unsupported(format));
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.limits.max_source_side);
        limits.max_image_height = Some(self.limits.max_source_side);
        limits.max_alloc = Some(self.limits.max_decode_bytes);

        let mut reader = ImageReader::with_format(Cursor::new(source.bytes()), format);
        reader.limits(limits);

        let decoded = reader.decode().map_err(|e| match e {
            ImageError::Limits(l) if matches!(l.kind(), LimitErrorKind::DimensionError) => {
                DecodeError::TooLarge {
                    max: self.limits.max_source_side,
                }
            }
            ImageError::Limits(_) => DecodeError::OverBudget {
                max_bytes: self.limits.max_decode_bytes,
            },
            other => DecodeError::Malformed(other.to_string()),
        })?;

        let (width, height) = (decoded.width(), decoded.height());
        let min = self.limits.min_side.max(1);
        if width < min || height < min {
            return Err(DecodeError::TooSmall { width, height, min });
        }

        let flattened = flatten_onto_white(&decoded);
        let (fit_w, fit_h) = fit_within(width, height, self.limits.max_side);
        let rgb = if (fit_w, fit_h) == (width, height) {
            flattened
        } else {
            imageops::resize(&flattened, fit_w, fit_h, FilterType::Triangle)
        };

        tracing::debug!(
            ?format,
            source_width = width,
            source_height = height,
            width = fit_w,
            height = fit_h,
            "decoded upload"
        );

        Bitmap::from_rgb(rgb).ok_or(DecodeError::Malformed("decoded to an empty surface".into()))
    }
}

/// Bounding-box fit: `scale = min(1, max_side / max(w, h))`, sides rounded, never below 1.
pub fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest == 0 || max_side == 0 {
        return (width.max(1), height.max(1));
    }
    let scale = (max_side as f64 / longest as f64).min(1.0);
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Content sniffing first; the declared media type only when the bytes are unrecognized.
fn sniff_format(source: &SourceImage) -> Result<ImageFormat, DecodeError> {
    image::guess_format(source.bytes())
        .ok()
        .or_else(|| source.media_type().and_then(ImageFormat::from_mime_type))
        .ok_or(DecodeError::UnknownFormat)
}

/// Composite any alpha channel over white.
fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let alpha = src[3] as u32;
        for c in 0..3 {
            let v = (src[c] as u32 * alpha + 255 * (255 - alpha) + 127) / 255;
            dst[c] = v as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba, RgbaImage};

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn png(width: u32, height: u32) -> SourceImage {
        let img = RgbImage::from_pixel(width, height, Rgb([40, 90, 160]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);
        SourceImage::new(bytes, Some("image/png".into()))
    }

    fn jpeg(width: u32, height: u32) -> SourceImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg);
        SourceImage::new(bytes, Some("image/jpeg".into()))
    }

    #[test]
    fn test_fit_within_downscales_landscape() {
        assert_eq!(fit_within(4000, 3000, 2200), (2200, 1650));
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(800, 600, 2200), (800, 600));
    }

    #[test]
    fn test_fit_within_extreme_aspect_keeps_one_pixel() {
        assert_eq!(fit_within(10_000, 1, 100), (100, 1));
    }

    #[test]
    fn test_decode_png() {
        let bmp = ImageDecoder::default().decode(&png(120, 80)).unwrap();
        assert_eq!(bmp.dimensions(), (120, 80));
        assert_eq!(*bmp.as_rgb().get_pixel(5, 5), Rgb([40, 90, 160]));
    }

    #[test]
    fn test_decode_jpeg_is_deterministic() {
        let source = jpeg(300, 200);
        let decoder = ImageDecoder::default();
        let a = decoder.decode(&source).unwrap();
        let b = decoder.decode(&source).unwrap();
        assert_eq!(a.dimensions(), (300, 200));
        assert_eq!(a.dimensions(), b.dimensions());
    }

    #[test]
    fn test_decode_downscales_to_max_side() {
        let decoder = ImageDecoder::new(DecodeLimits { max_side: 220, ..DecodeLimits::default() });
        let bmp = decoder.decode(&jpeg(400, 300)).unwrap();
        assert_eq!(bmp.dimensions(), (220, 165));
    }

    #[test]
    fn test_decode_min_side_floor() {
        let decoder = ImageDecoder::default();
        assert!(decoder.decode(&png(64, 64)).is_ok());
        assert!(matches!(
            decoder.decode(&png(63, 64)),
            Err(DecodeError::TooSmall { width: 63, height: 64, min: 64 })
        ));
        assert!(matches!(decoder.decode(&png(50, 50)), Err(DecodeError::TooSmall { .. })));
    }

    #[test]
    fn test_decode_rejects_oversized_source() {
        let decoder = ImageDecoder::new(DecodeLimits {
            max_source_side: 100,
            ..DecodeLimits::default()
        });
        assert!(decoder.decode(&png(100, 100)).is_ok());
        assert!(matches!(decoder.decode(&png(101, 90)), Err(DecodeError::TooLarge { max: 100 })));
    }

    #[test]
    fn test_decode_reports_allocation_budget_separately() {
        let decoder = ImageDecoder::new(DecodeLimits {
            max_decode_bytes: 1000,
            ..DecodeLimits::default()
        });
        assert!(matches!(
            decoder.decode(&png(100, 100)),
            Err(DecodeError::OverBudget { max_bytes: 1000 })
        ));
    }

    #[test]
    fn test_without_downscale_keeps_source_resolution() {
        let source = png(2400, 80);
        let limits = DecodeLimits::default();
        assert_eq!(ImageDecoder::new(limits).decode(&source).unwrap().dimensions(), (2200, 73));

        let full = ImageDecoder::new(limits.without_downscale()).decode(&source).unwrap();
        assert_eq!(full.dimensions(), (2400, 80));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let source = SourceImage::new(b"definitely not an image".to_vec(), None);
        assert!(matches!(
            ImageDecoder::default().decode(&source),
            Err(DecodeError::UnknownFormat)
        ));
    }

    #[test]
    fn test_decode_truncated_png_fails() {
        let mut bytes = png(100, 100).bytes().to_vec();
        bytes.truncate(bytes.len() / 2);
        let source = SourceImage::new(bytes, Some("image/png".into()));
        assert!(matches!(ImageDecoder::default().decode(&source), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_empty_fails() {
        let source = SourceImage::new(Vec::new(), Some("image/png".into()));
        assert!(matches!(ImageDecoder::default().decode(&source), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_flattens_transparency_to_white() {
        let mut img = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 0]));
        img.put_pixel(0, 0, Rgba([10, 20, 30, 255]));
        let bytes = encode(DynamicImage::ImageRgba8(img), ImageFormat::Png);
        let source = SourceImage::new(bytes, None);
        let bmp = ImageDecoder::default().decode(&source).unwrap();
        assert_eq!(*bmp.as_rgb().get_pixel(10, 10), Rgb([255, 255, 255]));
        assert_eq!(*bmp.as_rgb().get_pixel(0, 0), Rgb([10, 20, 30]));
    }
}
