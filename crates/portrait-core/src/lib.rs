//! portrait-core: ID-card portrait normalization.
//!
//! Decodes an uploaded photo, optionally replaces its background with flat
//! white through a segmentation model, guards against blank results, and
//! composes a fixed-size square portrait. Models run via ONNX Runtime behind
//! the [`SubjectModel`] boundary.

pub mod composer;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod handle;
pub mod isolator;
pub mod model;
pub mod pipeline;
pub mod quality;
pub mod segmenter;
pub mod types;

pub use composer::{CanvasComposer, ComposeError, CropPolicy};
pub use config::PipelineConfig;
pub use decoder::{DecodeError, ImageDecoder};
pub use handle::ModelHandle;
pub use isolator::SubjectIsolator;
pub use model::{ModelError, ModelOutput, NoopModel, SubjectModel};
pub use pipeline::{IsolationOutcome, Pipeline, PipelineError, Processed};
pub use quality::{GateReport, QualityGate};
pub use types::{Bitmap, ComposedPortrait, CropRect, Region, SourceImage};
