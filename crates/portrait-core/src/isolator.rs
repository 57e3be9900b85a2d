//! Best-effort background replacement.

use crate::handle::ModelHandle;
use crate::model::{ModelError, ModelOutput};
use crate::types::Bitmap;
use std::sync::Arc;
use std::time::Duration;

/// Replaces the background of a portrait with flat white, through a
/// segmentation capability. Framing and aspect ratio are preserved.
#[derive(Clone)]
pub struct SubjectIsolator {
    segmenter: Option<Arc<ModelHandle>>,
    deadline: Duration,
}

impl SubjectIsolator {
    pub fn new(segmenter: Option<Arc<ModelHandle>>, deadline: Duration) -> Self {
        Self { segmenter, deadline }
    }

    pub fn is_configured(&self) -> bool {
        self.segmenter.is_some()
    }

    /// Isolate the subject, or hand back `bitmap` unchanged on any failure.
    pub async fn isolate(&self, bitmap: Bitmap) -> Bitmap {
        match self.try_isolate(&bitmap).await {
            Ok(isolated) => isolated,
            Err(err) => {
                tracing::warn!(error = %err, "subject isolation failed; keeping original photo");
                bitmap
            }
        }
    }

    /// One isolation attempt, exposing why it failed. Never retried.
    pub async fn try_isolate(&self, bitmap: &Bitmap) -> Result<Bitmap, ModelError> {
        let segmenter = self
            .segmenter
            .as_ref()
            .ok_or_else(|| ModelError::Unavailable("no segmentation model configured".into()))?;

        let (width, height) = bitmap.dimensions();
        let background = Bitmap::white(width, height);

        match segmenter.run(bitmap.clone(), Some(background), self.deadline).await? {
            ModelOutput::Segmented(out) if out.dimensions() == (width, height) => {
                tracing::debug!(model = segmenter.name(), width, height, "subject isolated");
                Ok(out)
            }
            ModelOutput::Segmented(out) => Err(ModelError::Malformed(format!(
                "segmenter returned {}x{} for a {width}x{height} input",
                out.width(),
                out.height()
            ))),
            ModelOutput::Detected(_) => Err(ModelError::Malformed(
                "segmenter answered with detections".into(),
            )),
        }
    }
}
