use image::{ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;

/// Solid white, the backing color of every surface this crate produces.
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Raw uploaded bytes plus the media type the uploader declared.
#[derive(Debug, Clone)]
pub struct SourceImage {
    bytes: Vec<u8>,
    media_type: Option<String>,
}

impl SourceImage {
    pub fn new(bytes: Vec<u8>, media_type: Option<String>) -> Self {
        Self { bytes, media_type }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Declared media type (e.g. `image/jpeg`), if any.
    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Decoded RGB raster. Width and height are always non-zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    image: RgbImage,
}

impl Bitmap {
    /// Wrap an RGB buffer. Returns `None` for a zero-sized image.
    pub fn from_rgb(image: RgbImage) -> Option<Self> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        Some(Self { image })
    }

    /// A bitmap of the given size filled with `color`.
    ///
    /// Zero sides are bumped to 1.
    pub fn filled(width: u32, height: u32, color: Rgb<u8>) -> Self {
        Self {
            image: RgbImage::from_pixel(width.max(1), height.max(1), color),
        }
    }

    /// Flat white surface, the replacement background for subject isolation.
    pub fn white(width: u32, height: u32) -> Self {
        Self::filled(width, height, WHITE)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_rgb(self) -> RgbImage {
        self.image
    }
}

/// A located subject, in bitmap pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl Region {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Finite coordinates and a positive extent.
    pub fn is_usable(&self) -> bool {
        [self.x, self.y, self.width, self.height, self.confidence]
            .iter()
            .all(|v| v.is_finite())
            && self.width > 0.0
            && self.height > 0.0
    }
}

/// Square crop window inside a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub size: u32,
}

impl CropRect {
    pub fn new(left: u32, top: u32, size: u32) -> Self {
        Self { left, top, size }
    }

    /// Whether the window lies entirely within a `width`×`height` surface.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.size > 0
            && u64::from(self.left) + u64::from(self.size) <= u64::from(width)
            && u64::from(self.top) + u64::from(self.size) <= u64::from(height)
    }
}

/// Final fixed-size square portrait handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedPortrait {
    image: RgbImage,
}

impl ComposedPortrait {
    pub(crate) fn new(image: RgbImage) -> Self {
        debug_assert_eq!(image.width(), image.height());
        Self { image }
    }

    /// Side length in pixels.
    pub fn side(&self) -> u32 {
        self.image.width()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_rgb(self) -> RgbImage {
        self.image
    }

    /// Encode as PNG.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }

    /// Write a PNG file, whatever the extension of `path`.
    pub fn save_png(&self, path: &Path) -> Result<(), image::ImageError> {
        self.image.save_with_format(path, ImageFormat::Png)
    }
}

impl From<ComposedPortrait> for Bitmap {
    fn from(portrait: ComposedPortrait) -> Self {
        // A composed portrait is never zero-sized.
        Bitmap {
            image: portrait.image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_rejects_zero_size() {
        assert!(Bitmap::from_rgb(RgbImage::new(0, 10)).is_none());
        assert!(Bitmap::from_rgb(RgbImage::new(10, 0)).is_none());
        assert!(Bitmap::from_rgb(RgbImage::new(1, 1)).is_some());
    }

    #[test]
    fn test_white_bitmap() {
        let bmp = Bitmap::white(4, 3);
        assert_eq!(bmp.dimensions(), (4, 3));
        assert!(bmp.as_rgb().pixels().all(|p| *p == WHITE));
    }

    #[test]
    fn test_region_center_and_usability() {
        let r = Region { x: 800.0, y: 550.0, width: 400.0, height: 500.0, confidence: 0.9 };
        assert_eq!(r.center(), (1000.0, 800.0));
        assert!(r.is_usable());

        let nan = Region { x: f32::NAN, ..r };
        assert!(!nan.is_usable());
        let flat = Region { height: 0.0, ..r };
        assert!(!flat.is_usable());
    }

    #[test]
    fn test_crop_rect_fits() {
        assert!(CropRect::new(0, 0, 10).fits(10, 10));
        assert!(CropRect::new(5, 0, 5).fits(10, 5));
        assert!(!CropRect::new(6, 0, 5).fits(10, 5));
        assert!(!CropRect::new(0, 0, 0).fits(10, 10));
    }

    #[test]
    fn test_portrait_png_encodes() {
        let portrait = ComposedPortrait::new(RgbImage::from_pixel(8, 8, WHITE));
        let png = portrait.to_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }
}
