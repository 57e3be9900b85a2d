use crate::composer::{self, CropPolicy, SubjectCropParams};
use crate::decoder::{self, DecodeLimits};
use crate::quality::{self, QualityGate};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every tunable of the portrait pipeline. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Longest side of the working bitmap after decode.
    pub max_side: u32,
    /// Smallest accepted side of an upload.
    pub min_side: u32,
    /// Largest accepted side of an upload, before downscaling.
    pub max_source_side: u32,
    /// Allocation budget of the image decoder.
    pub max_decode_bytes: u64,
    /// Side of the composed square portrait.
    pub output_side: u32,
    pub crop_policy: CropPolicy,
    pub face_scale: f32,
    pub eye_line: f32,
    pub eye_band: f32,
    /// Detections below this confidence are ignored.
    pub min_detection_confidence: f32,
    /// Whether to attempt background replacement at all.
    pub isolate: bool,
    pub quality_samples: usize,
    pub white_threshold: u8,
    pub max_white_fraction: f32,
    pub quality_seed: u64,
    /// Upper bound on waiting for a single model call.
    pub model_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_side: decoder::DEFAULT_MAX_SIDE,
            min_side: decoder::DEFAULT_MIN_SIDE,
            max_source_side: decoder::DEFAULT_MAX_SOURCE_SIDE,
            max_decode_bytes: decoder::DEFAULT_MAX_DECODE_BYTES,
            output_side: composer::DEFAULT_OUTPUT_SIDE,
            crop_policy: CropPolicy::default(),
            face_scale: composer::DEFAULT_FACE_SCALE,
            eye_line: composer::DEFAULT_EYE_LINE,
            eye_band: composer::DEFAULT_EYE_BAND,
            min_detection_confidence: 0.5,
            isolate: true,
            quality_samples: quality::DEFAULT_SAMPLE_COUNT,
            white_threshold: quality::DEFAULT_WHITE_THRESHOLD,
            max_white_fraction: quality::DEFAULT_MAX_WHITE_FRACTION,
            quality_seed: quality::DEFAULT_SEED,
            model_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            min_side: self.min_side,
            max_source_side: self.max_source_side,
            max_side: self.max_side,
            max_decode_bytes: self.max_decode_bytes,
        }
    }

    pub fn subject_params(&self) -> SubjectCropParams {
        SubjectCropParams {
            face_scale: self.face_scale,
            eye_line: self.eye_line,
            eye_band: self.eye_band,
        }
    }

    pub fn quality_gate(&self) -> QualityGate {
        QualityGate {
            white_threshold: self.white_threshold,
            max_white_fraction: self.max_white_fraction,
            seed: self.quality_seed,
        }
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs.max(1))
    }
}
