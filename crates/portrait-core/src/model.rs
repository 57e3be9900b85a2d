//! The segmentation/detection capability boundary.
//!
//! Every model the pipeline talks to implements [`SubjectModel`]. Calls are
//! synchronous and run on the worker thread owned by a
//! [`ModelHandle`](crate::handle::ModelHandle).

use crate::types::{Bitmap, Region};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("malformed model output: {0}")]
    Malformed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl ModelError {
    /// True when the capability never became usable, as opposed to a failed call.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ModelError::Unavailable(_) | ModelError::ModelNotFound(_))
    }
}

/// What a capability call produced.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// Replacement surface (segmentation mode).
    Segmented(Bitmap),
    /// Candidate subject regions (detection mode).
    Detected(Vec<Region>),
}

/// A detection/segmentation capability.
pub trait SubjectModel: Send + 'static {
    fn name(&self) -> &str;

    /// Run one inference. `background`, when given, has the same dimensions
    /// as `bitmap` and is what a segmenter composites the subject onto.
    fn run(
        &mut self,
        bitmap: &Bitmap,
        background: Option<&Bitmap>,
    ) -> Result<ModelOutput, ModelError>;
}

/// Returns its input untouched. Stands in for a real model.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopModel;

impl SubjectModel for NoopModel {
    fn name(&self) -> &str {
        "noop"
    }

    fn run(
        &mut self,
        bitmap: &Bitmap,
        _background: Option<&Bitmap>,
    ) -> Result<ModelOutput, ModelError> {
        Ok(ModelOutput::Segmented(bitmap.clone()))
    }
}

/// Pick the subject among detector candidates: highest confidence at or
/// above `min_confidence`, larger area on ties. Unusable regions are ignored.
pub fn pick_subject(regions: &[Region], min_confidence: f32) -> Option<Region> {
    regions
        .iter()
        .filter(|r| r.is_usable() && r.confidence >= min_confidence)
        .max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then_with(|| a.area().total_cmp(&b.area()))
        })
        .copied()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted models for exercising the fallback paths.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Paints the subject out entirely: returns the background as-is.
    pub struct WhiteoutModel;

    impl SubjectModel for WhiteoutModel {
        fn name(&self) -> &str {
            "whiteout"
        }

        fn run(
            &mut self,
            bitmap: &Bitmap,
            background: Option<&Bitmap>,
        ) -> Result<ModelOutput, ModelError> {
            let bg = background
                .cloned()
                .unwrap_or_else(|| Bitmap::white(bitmap.width(), bitmap.height()));
            Ok(ModelOutput::Segmented(bg))
        }
    }

    /// Keeps the left half of the subject, background elsewhere.
    pub struct HalfModel;

    impl SubjectModel for HalfModel {
        fn name(&self) -> &str {
            "half"
        }

        fn run(
            &mut self,
            bitmap: &Bitmap,
            background: Option<&Bitmap>,
        ) -> Result<ModelOutput, ModelError> {
            let bg = background.ok_or_else(|| ModelError::InferenceFailed("no background".into()))?;
            let mut out = bg.as_rgb().clone();
            for (x, y, px) in bitmap.as_rgb().enumerate_pixels() {
                if x < bitmap.width() / 2 {
                    out.put_pixel(x, y, *px);
                }
            }
            Ok(ModelOutput::Segmented(Bitmap::from_rgb(out).expect("non-empty")))
        }
    }

    /// Always errors.
    pub struct FailingModel;

    impl SubjectModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&mut self, _: &Bitmap, _: Option<&Bitmap>) -> Result<ModelOutput, ModelError> {
            Err(ModelError::InferenceFailed("scripted failure".into()))
        }
    }

    /// Panics on every call.
    pub struct PanickingModel;

    impl SubjectModel for PanickingModel {
        fn name(&self) -> &str {
            "panicking"
        }

        fn run(&mut self, _: &Bitmap, _: Option<&Bitmap>) -> Result<ModelOutput, ModelError> {
            panic!("scripted panic")
        }
    }

    /// Returns a surface of the wrong size.
    pub struct ResizingModel;

    impl SubjectModel for ResizingModel {
        fn name(&self) -> &str {
            "resizing"
        }

        fn run(&mut self, bitmap: &Bitmap, _: Option<&Bitmap>) -> Result<ModelOutput, ModelError> {
            Ok(ModelOutput::Segmented(Bitmap::white(bitmap.width() + 1, bitmap.height())))
        }
    }

    /// Sleeps before answering.
    pub struct SlowModel(pub Duration);

    impl SubjectModel for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        fn run(&mut self, bitmap: &Bitmap, _: Option<&Bitmap>) -> Result<ModelOutput, ModelError> {
            std::thread::sleep(self.0);
            Ok(ModelOutput::Segmented(bitmap.clone()))
        }
    }

    /// Reports fixed regions and counts calls.
    pub struct FixedRegionsModel {
        pub regions: Vec<Region>,
        pub calls: Arc<AtomicUsize>,
    }

    impl SubjectModel for FixedRegionsModel {
        fn name(&self) -> &str {
            "fixed-regions"
        }

        fn run(&mut self, _: &Bitmap, _: Option<&Bitmap>) -> Result<ModelOutput, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelOutput::Detected(self.regions.clone()))
        }
    }
}
