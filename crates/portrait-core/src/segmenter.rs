//! Portrait matting via ONNX Runtime.
//!
//! Runs a single-input, single-output matting network (MODNet-style: NCHW RGB
//! in, one-channel alpha matte out) and alpha-composites the subject over the
//! caller's background.

use crate::model::{ModelError, ModelOutput, SubjectModel};
use crate::types::Bitmap;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub const MATTING_INPUT_SIZE: u32 = 512;
const MATTING_MEAN: f32 = 127.5;
const MATTING_STD: f32 = 127.5;

/// Matting-model backed segmenter.
pub struct MattingSegmenter {
    session: Session,
    input_size: u32,
}

impl MattingSegmenter {
    /// Load the matting ONNX model from the given path.
    pub fn load(model_path: &str, input_size: u32) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input_size,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded matting model"
        );

        Ok(Self {
            session,
            input_size: input_size.max(32),
        })
    }

    /// Predict an alpha matte at the bitmap's own resolution.
    fn matte(&mut self, bitmap: &Bitmap) -> Result<GrayImage, ModelError> {
        let side = self.input_size;
        let input = preprocess(bitmap.as_rgb(), side);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("matte extraction: {e}")))?;

        let expected = (side * side) as usize;
        if raw.len() != expected {
            return Err(ModelError::Malformed(format!(
                "expected a {side}x{side} matte ({expected} values), got {}",
                raw.len()
            )));
        }

        let matte = matte_to_gray(raw, side)
            .ok_or_else(|| ModelError::Malformed("matte buffer size mismatch".into()))?;
        Ok(imageops::resize(&matte, bitmap.width(), bitmap.height(), FilterType::Triangle))
    }
}

impl SubjectModel for MattingSegmenter {
    fn name(&self) -> &str {
        "matting"
    }

    fn run(
        &mut self,
        bitmap: &Bitmap,
        background: Option<&Bitmap>,
    ) -> Result<ModelOutput, ModelError> {
        let matte = self.matte(bitmap)?;
        let white;
        let background = match background {
            Some(bg) => bg,
            None => {
                white = Bitmap::white(bitmap.width(), bitmap.height());
                &white
            }
        };
        let composite = composite(bitmap.as_rgb(), background.as_rgb(), &matte)?;
        Bitmap::from_rgb(composite)
            .map(ModelOutput::Segmented)
            .ok_or_else(|| ModelError::Malformed("empty composite".into()))
    }
}

/// Stretch to `side`×`side` and normalize into an NCHW RGB tensor.
fn preprocess(image: &RgbImage, side: u32) -> Array4<f32> {
    let resized = imageops::resize(image, side, side, FilterType::Triangle);
    let s = side as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - MATTING_MEAN) / MATTING_STD;
        }
    }
    tensor
}

/// Quantize a row-major [0, 1] matte.
fn matte_to_gray(raw: &[f32], side: u32) -> Option<GrayImage> {
    let bytes = raw
        .iter()
        .map(|&a| if a.is_finite() { (a.clamp(0.0, 1.0) * 255.0).round() as u8 } else { 0 })
        .collect();
    GrayImage::from_raw(side, side, bytes)
}

/// `out = alpha * subject + (1 - alpha) * background`, per channel.
fn composite(
    subject: &RgbImage,
    background: &RgbImage,
    matte: &GrayImage,
) -> Result<RgbImage, ModelError> {
    let dims = subject.dimensions();
    if dims != background.dimensions() || dims != matte.dimensions() {
        return Err(ModelError::Malformed(format!(
            "size mismatch: subject {:?}, background {:?}, matte {:?}",
            subject.dimensions(),
            background.dimensions(),
            matte.dimensions()
        )));
    }
    let mut out = RgbImage::new(subject.width(), subject.height());
    for (((dst, fg), bg), a) in out
        .pixels_mut()
        .zip(subject.pixels())
        .zip(background.pixels())
        .zip(matte.pixels())
    {
        let alpha = a[0] as u32;
        for c in 0..3 {
            dst[c] = ((fg[c] as u32 * alpha + bg[c] as u32 * (255 - alpha) + 127) / 255) as u8;
        }
    }
    Ok(out)
}
