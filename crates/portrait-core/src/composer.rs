//! Square crop selection and fixed-size portrait composition.
//!
//! Two crop policies exist and a deployment picks one through
//! [`CropPolicy`]:
//!
//! - **Centered**: the largest square centered on the bitmap.
//! - **Subject-aware**: a square sized from a detected face region, with the
//!   face's upper band placed near a fixed fraction of the output height.
//!
//! Every crop is clamped by shifting it into the bitmap, never by shrinking it.

use crate::types::{Bitmap, ComposedPortrait, CropRect, Region, WHITE};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_OUTPUT_SIDE: u32 = 1024;
pub const DEFAULT_FACE_SCALE: f32 = 2.4;
pub const DEFAULT_EYE_LINE: f32 = 0.4;
pub const DEFAULT_EYE_BAND: f32 = 0.35;

/// Fallback vertical anchor inside the region when the eye-line math is not finite.
const LOWER_MIDDLE: f32 = 0.75;

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("output side must be at least 1px")]
    InvalidOutputSize,
    #[error("crop size must be at least 1px")]
    EmptyCrop,
    #[error("crop of {size}px does not fit a {width}x{height} bitmap")]
    CropTooLarge { size: u32, width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CropPolicy {
    #[default]
    Centered,
    SubjectAware,
}

/// Tunables of the subject-aware policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectCropParams {
    /// Crop side as a multiple of the region's longer side.
    pub face_scale: f32,
    /// Where the region's upper band lands, as a fraction of the crop from the top.
    pub eye_line: f32,
    /// Position of the upper band inside the region, as a fraction of its height.
    pub eye_band: f32,
}

impl Default for SubjectCropParams {
    fn default() -> Self {
        Self {
            face_scale: DEFAULT_FACE_SCALE,
            eye_line: DEFAULT_EYE_LINE,
            eye_band: DEFAULT_EYE_BAND,
        }
    }
}

/// Largest square centered on a `width`×`height` surface.
pub fn centered_square(width: u32, height: u32) -> CropRect {
    let size = width.min(height).max(1);
    CropRect {
        left: width.saturating_sub(size) / 2,
        top: height.saturating_sub(size) / 2,
        size,
    }
}

/// Square framed around a detected subject.
pub fn subject_square(
    width: u32,
    height: u32,
    region: &Region,
    params: &SubjectCropParams,
) -> CropRect {
    let short = width.min(height).max(1);
    let wanted = region.width.max(region.height) * params.face_scale;
    let size = if wanted.is_finite() {
        (wanted.round().max(1.0) as u32).min(short)
    } else {
        short
    };
    let side = size as f32;

    let (cx, _) = region.center();
    let left = if cx.is_finite() {
        cx - side / 2.0
    } else {
        (width as f32 - side) / 2.0
    };

    let band_y = region.y + region.height * params.eye_band;
    let mut top = band_y - side * params.eye_line;
    if !top.is_finite() {
        top = region.y + region.height * LOWER_MIDDLE - side / 2.0;
    }
    if !top.is_finite() {
        top = (height as f32 - side) / 2.0;
    }

    CropRect {
        left: shift_into(left, size, width),
        top: shift_into(top, size, height),
        size,
    }
}

/// Shift a user-supplied crop into bounds.
///
/// Fails when the crop is empty or larger than the bitmap's shorter side,
/// since it could only fit by shrinking.
pub fn clamp_manual(width: u32, height: u32, rect: CropRect) -> Result<CropRect, ComposeError> {
    if rect.size == 0 {
        return Err(ComposeError::EmptyCrop);
    }
    if rect.size > width.min(height) {
        return Err(ComposeError::CropTooLarge {
            size: rect.size,
            width,
            height,
        });
    }
    Ok(CropRect {
        left: rect.left.min(width - rect.size),
        top: rect.top.min(height - rect.size),
        size: rect.size,
    })
}

/// Round `start` and clamp it to `[0, extent - size]`.
fn shift_into(start: f32, size: u32, extent: u32) -> u32 {
    let max_start = extent.saturating_sub(size);
    if !start.is_finite() || start <= 0.0 {
        return 0;
    }
    (start.round() as u32).min(max_start)
}

/// Draws square crops of a bitmap onto a white square canvas.
#[derive(Debug, Clone, Copy)]
pub struct CanvasComposer {
    output_side: u32,
}

impl Default for CanvasComposer {
    fn default() -> Self {
        Self {
            output_side: DEFAULT_OUTPUT_SIDE,
        }
    }
}

impl CanvasComposer {
    pub fn new(output_side: u32) -> Self {
        Self { output_side }
    }

    pub fn output_side(&self) -> u32 {
        self.output_side
    }

    /// Compose the centered square of `bitmap`.
    pub fn compose_centered(&self, bitmap: &Bitmap) -> Result<ComposedPortrait, ComposeError> {
        self.compose(bitmap, centered_square(bitmap.width(), bitmap.height()))
    }

    /// Scale the `rect` region of `bitmap` onto the output canvas.
    ///
    /// A crop already of the output size is copied without resampling.
    pub fn compose(
        &self,
        bitmap: &Bitmap,
        rect: CropRect,
    ) -> Result<ComposedPortrait, ComposeError> {
        if self.output_side == 0 {
            return Err(ComposeError::InvalidOutputSize);
        }
        let (width, height) = bitmap.dimensions();
        if rect.size == 0 {
            return Err(ComposeError::EmptyCrop);
        }
        if !rect.fits(width, height) {
            return Err(ComposeError::CropTooLarge {
                size: rect.size,
                width,
                height,
            });
        }

        let crop = imageops::crop_imm(bitmap.as_rgb(), rect.left, rect.top, rect.size, rect.size)
            .to_image();
        let scaled = if rect.size == self.output_side {
            crop
        } else {
            imageops::resize(&crop, self.output_side, self.output_side, FilterType::Lanczos3)
        };

        let mut canvas = RgbImage::from_pixel(self.output_side, self.output_side, WHITE);
        imageops::replace(&mut canvas, &scaled, 0, 0);

        tracing::debug!(
            left = rect.left,
            top = rect.top,
            size = rect.size,
            output = self.output_side,
            "composed portrait"
        );

        Ok(ComposedPortrait::new(canvas))
    }
}
