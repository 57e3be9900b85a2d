//! Orchestration: decode → isolate → quality gate → (locate) → compose.
//!
//! Only decode and compose failures reach the caller. Everything that goes
//! wrong around the models is absorbed here and reported through
//! [`IsolationOutcome`].

use crate::composer::{self, CanvasComposer, ComposeError, CropPolicy, SubjectCropParams};
use crate::config::PipelineConfig;
use crate::decoder::{DecodeError, ImageDecoder};
use crate::handle::ModelHandle;
use crate::isolator::SubjectIsolator;
use crate::model::{self, ModelOutput};
use crate::quality::QualityGate;
use crate::types::{Bitmap, ComposedPortrait, CropRect, Region, SourceImage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot read this photo, try another: {0}")]
    Decode(#[from] DecodeError),
    #[error("cannot compose portrait: {0}")]
    Compose(#[from] ComposeError),
}

/// What happened to the background replacement step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum IsolationOutcome {
    /// The isolated bitmap was used.
    Isolated,
    /// Isolation disabled or no segmenter injected.
    NotConfigured,
    /// The segmenter could not be loaded.
    CapabilityUnavailable { reason: String },
    /// The segmenter was called and failed.
    CapabilityFailure { reason: String },
    /// The segmenter answered but the result looked blank.
    QualityRejected { near_white: f32 },
}

impl IsolationOutcome {
    pub fn used_isolated(&self) -> bool {
        matches!(self, IsolationOutcome::Isolated)
    }
}

/// Result of an automatic pass.
#[derive(Debug, Clone)]
pub struct Processed {
    pub portrait: ComposedPortrait,
    pub outcome: IsolationOutcome,
    /// Crop applied to the working bitmap.
    pub crop: CropRect,
    /// Subject the crop was framed on, subject-aware policy only.
    pub subject: Option<Region>,
}

/// The photo-normalization pipeline. Cheap to share behind `Arc`.
pub struct Pipeline {
    decoder: ImageDecoder,
    isolator: SubjectIsolator,
    gate: QualityGate,
    composer: CanvasComposer,
    detector: Option<Arc<ModelHandle>>,
    policy: CropPolicy,
    subject_params: SubjectCropParams,
    isolate: bool,
    quality_samples: usize,
    min_detection_confidence: f32,
    deadline: Duration,
}

impl Pipeline {
    /// Build a pipeline. Model handles are injected so that one loaded model can
    /// serve every pipeline in the process.
    pub fn new(
        config: &PipelineConfig,
        segmenter: Option<Arc<ModelHandle>>,
        detector: Option<Arc<ModelHandle>>,
    ) -> Self {
        let deadline = config.model_timeout();
        Self {
            decoder: ImageDecoder::new(config.decode_limits()),
            isolator: SubjectIsolator::new(segmenter, deadline),
            gate: config.quality_gate(),
            composer: CanvasComposer::new(config.output_side),
            detector,
            policy: config.crop_policy,
            subject_params: config.subject_params(),
            isolate: config.isolate,
            quality_samples: config.quality_samples,
            min_detection_confidence: config.min_detection_confidence,
            deadline,
        }
    }

    pub fn policy(&self) -> CropPolicy {
        self.policy
    }

    pub fn decoder(&self) -> &ImageDecoder {
        &self.decoder
    }

    /// Automatic pass: the composed portrait only.
    pub async fn process(&self, source: &SourceImage) -> Result<ComposedPortrait, PipelineError> {
        self.process_detailed(source).await.map(|p| p.portrait)
    }

    /// Automatic pass with a report of what each step did.
    pub async fn process_detailed(&self, source: &SourceImage) -> Result<Processed, PipelineError> {
        let original = self.decoder.decode(source)?;
        tracing::info!(
            width = original.width(),
            height = original.height(),
            bytes = source.len(),
            "photo decoded"
        );

        let (working, outcome) = self.isolate_with_gate(original).await;
        tracing::info!(?outcome, "isolation step finished");

        let subject = match self.policy {
            CropPolicy::Centered => None,
            CropPolicy::SubjectAware => self.locate_subject(&working).await,
        };

        let (width, height) = working.dimensions();
        let crop = match &subject {
            Some(region) => composer::subject_square(width, height, region, &self.subject_params),
            None => composer::centered_square(width, height),
        };

        let portrait = self.composer.compose(&working, crop)?;
        tracing::info!(
            policy = ?self.policy,
            left = crop.left,
            top = crop.top,
            size = crop.size,
            side = portrait.side(),
            "portrait composed"
        );

        Ok(Processed {
            portrait,
            outcome,
            crop,
            subject,
        })
    }

    /// Manual pass: compose a user-chosen square of `bitmap`, shifted into bounds.
    pub fn recompose(
        &self,
        bitmap: &Bitmap,
        rect: CropRect,
    ) -> Result<ComposedPortrait, PipelineError> {
        let rect = composer::clamp_manual(bitmap.width(), bitmap.height(), rect)?;
        Ok(self.composer.compose(bitmap, rect)?)
    }

    /// Run isolation and the quality gate; the pre-isolation bitmap is kept
    /// until the isolated one is accepted.
    async fn isolate_with_gate(&self, original: Bitmap) -> (Bitmap, IsolationOutcome) {
        if !self.isolate || !self.isolator.is_configured() {
            return (original, IsolationOutcome::NotConfigured);
        }

        let isolated = match self.isolator.try_isolate(&original).await {
            Ok(isolated) => isolated,
            Err(err) if err.is_unavailable() => {
                tracing::warn!(error = %err, "segmentation unavailable; using original photo");
                let reason = err.to_string();
                return (original, IsolationOutcome::CapabilityUnavailable { reason });
            }
            Err(err) => {
                tracing::warn!(error = %err, "segmentation failed; using original photo");
                return (original, IsolationOutcome::CapabilityFailure { reason: err.to_string() });
            }
        };

        let report = self.gate.evaluate(&isolated, self.quality_samples);
        if report.acceptable {
            tracing::debug!(near_white = report.near_white, "isolation result accepted");
            (isolated, IsolationOutcome::Isolated)
        } else {
            let near_white = report.near_white;
            tracing::warn!(near_white, "isolation result looks blank; using original photo");
            (original, IsolationOutcome::QualityRejected { near_white })
        }
    }

    /// Best-effort subject detection for the subject-aware policy.
    async fn locate_subject(&self, bitmap: &Bitmap) -> Option<Region> {
        let detector = self.detector.as_ref()?;
        match detector.run(bitmap.clone(), None, self.deadline).await {
            Ok(ModelOutput::Detected(regions)) => {
                let picked = model::pick_subject(&regions, self.min_detection_confidence);
                tracing::debug!(candidates = regions.len(), picked = ?picked, "subject detection");
                picked
            }
            Ok(ModelOutput::Segmented(_)) => {
                tracing::warn!("detector answered with a surface; centering instead");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "subject detection failed; centering instead");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{
        FailingModel, FixedRegionsModel, HalfModel, PanickingModel, WhiteoutModel,
    };
    use crate::model::{ModelError, NoopModel, SubjectModel};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> PipelineConfig {
        PipelineConfig {
            output_side: 128,
            model_timeout_secs: 5,
            ..PipelineConfig::default()
        }
    }

    fn photo_source(width: u32, height: u32) -> SourceImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 200) as u8, (y % 200) as u8, 90])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
        SourceImage::new(buf.into_inner(), Some("image/png".into()))
    }

    fn handle<M: SubjectModel>(model: M) -> Option<Arc<ModelHandle>> {
        Some(Arc::new(ModelHandle::from_model(model)))
    }

    /// Portrait composed straight from the decoded original, no isolation.
    fn baseline(cfg: &PipelineConfig, source: &SourceImage) -> ComposedPortrait {
        let original = ImageDecoder::new(cfg.decode_limits()).decode(source).unwrap();
        CanvasComposer::new(cfg.output_side).compose_centered(&original).unwrap()
    }

    #[tokio::test]
    async fn test_output_is_fixed_size() {
        let pipeline = Pipeline::new(&config(), None, None);
        for (w, h) in [(300, 200), (200, 300), (64, 64)] {
            let portrait = pipeline.process(&photo_source(w, h)).await.unwrap();
            assert_eq!(portrait.side(), 128);
        }
    }

    #[tokio::test]
    async fn test_no_segmenter_reports_not_configured() {
        let pipeline = Pipeline::new(&config(), None, None);
        let processed = pipeline.process_detailed(&photo_source(200, 100)).await.unwrap();
        assert_eq!(processed.outcome, IsolationOutcome::NotConfigured);
        assert_eq!(processed.crop, CropRect::new(50, 0, 100));
    }

    #[tokio::test]
    async fn test_isolation_disabled_skips_model() {
        let cfg = PipelineConfig { isolate: false, ..config() };
        let pipeline = Pipeline::new(&cfg, handle(FailingModel), None);
        let processed = pipeline.process_detailed(&photo_source(100, 100)).await.unwrap();
        assert_eq!(processed.outcome, IsolationOutcome::NotConfigured);
    }

    #[tokio::test]
    async fn test_isolated_result_is_used() {
        let cfg = config();
        let source = photo_source(160, 160);
        let pipeline = Pipeline::new(&cfg, handle(HalfModel), None);
        let processed = pipeline.process_detailed(&source).await.unwrap();
        assert!(processed.outcome.used_isolated());
        assert_ne!(processed.portrait, baseline(&cfg, &source));
        // right half was replaced by white
        assert_eq!(*processed.portrait.as_rgb().get_pixel(120, 64), Rgb([255, 255, 255]));
    }

    #[tokio::test]
    async fn test_blank_isolation_falls_back_to_original() {
        let cfg = config();
        let source = photo_source(240, 180);
        let pipeline = Pipeline::new(&cfg, handle(WhiteoutModel), None);
        let processed = pipeline.process_detailed(&source).await.unwrap();
        let expected = cfg.quality_gate().evaluate(&Bitmap::white(240, 180), cfg.quality_samples);
        assert!(!expected.acceptable);
        assert_eq!(
            processed.outcome,
            IsolationOutcome::QualityRejected { near_white: expected.near_white }
        );
        assert_eq!(processed.portrait, baseline(&cfg, &source));
    }

    #[tokio::test]
    async fn test_failing_isolator_falls_back_silently() {
        let cfg = config();
        let source = photo_source(240, 180);
        for segmenter in [handle(FailingModel), handle(PanickingModel)] {
            let pipeline = Pipeline::new(&cfg, segmenter, None);
            let processed = pipeline.process_detailed(&source).await.unwrap();
            assert!(matches!(processed.outcome, IsolationOutcome::CapabilityFailure { .. }));
            assert_eq!(processed.portrait, baseline(&cfg, &source));
        }
    }

    #[tokio::test]
    async fn test_unloadable_segmenter_is_unavailable() {
        let cfg = config();
        let source = photo_source(120, 90);
        let segmenter = Arc::new(ModelHandle::new("matting", || {
            Err(ModelError::ModelNotFound("/models/modnet.onnx".into()))
        }));
        let pipeline = Pipeline::new(&cfg, Some(segmenter), None);
        let processed = pipeline.process_detailed(&source).await.unwrap();
        assert!(matches!(processed.outcome, IsolationOutcome::CapabilityUnavailable { .. }));
        assert_eq!(processed.portrait, baseline(&cfg, &source));
    }

    #[tokio::test]
    async fn test_decode_error_surfaces() {
        let pipeline = Pipeline::new(&config(), handle(NoopModel), None);
        let bad = SourceImage::new(b"GIF89a-but-not-really".to_vec(), Some("image/gif".into()));
        assert!(matches!(pipeline.process(&bad).await, Err(PipelineError::Decode(_))));
        assert!(matches!(
            pipeline.process(&photo_source(50, 50)).await,
            Err(PipelineError::Decode(DecodeError::TooSmall { .. }))
        ));
    }

    #[tokio::test]
    async fn test_subject_aware_uses_detection() {
        let cfg = PipelineConfig { crop_policy: CropPolicy::SubjectAware, ..config() };
        let calls = Arc::new(AtomicUsize::new(0));
        let face = Region { x: 40.0, y: 30.0, width: 40.0, height: 50.0, confidence: 0.95 };
        let detector = handle(FixedRegionsModel { regions: vec![face], calls: calls.clone() });
        let pipeline = Pipeline::new(&cfg, None, detector);

        let processed = pipeline.process_detailed(&photo_source(400, 300)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(processed.subject, Some(face));
        // 50 * 2.4 = 120, centered on x = 60 -> 0; band 47.5 - 48 -> 0
        assert_eq!(processed.crop, CropRect::new(0, 0, 120));
        assert_eq!(processed.portrait.side(), 128);
    }

    #[tokio::test]
    async fn test_subject_aware_without_detection_centers() {
        let cfg = PipelineConfig { crop_policy: CropPolicy::SubjectAware, ..config() };
        let calls = Arc::new(AtomicUsize::new(0));
        let weak = Region { x: 40.0, y: 30.0, width: 40.0, height: 50.0, confidence: 0.1 };
        let pipeline = Pipeline::new(
            &cfg,
            None,
            handle(FixedRegionsModel { regions: vec![weak], calls }),
        );
        let processed = pipeline.process_detailed(&photo_source(400, 300)).await.unwrap();
        assert_eq!(processed.subject, None);
        assert_eq!(processed.crop, CropRect::new(50, 0, 300));

        let pipeline = Pipeline::new(&cfg, None, handle(FailingModel));
        let processed = pipeline.process_detailed(&photo_source(400, 300)).await.unwrap();
        assert_eq!(processed.crop, CropRect::new(50, 0, 300));
    }

    #[tokio::test]
    async fn test_centered_policy_never_calls_detector() {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = handle(FixedRegionsModel { regions: Vec::new(), calls: calls.clone() });
        let pipeline = Pipeline::new(&config(), None, detector);
        pipeline.process(&photo_source(100, 100)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recompose_after_automatic_pass() {
        let pipeline = Pipeline::new(&config(), None, None);
        let portrait = pipeline.process(&photo_source(300, 200)).await.unwrap();
        let surface = Bitmap::from(portrait);

        let adjusted = pipeline.recompose(&surface, CropRect::new(100, 100, 64)).unwrap();
        assert_eq!(adjusted.side(), 128);

        assert!(matches!(
            pipeline.recompose(&surface, CropRect::new(0, 0, 129)),
            Err(PipelineError::Compose(ComposeError::CropTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_shared_segmenter_loads_once_across_pipelines() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let segmenter = Arc::new(ModelHandle::new("half", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(HalfModel) as Box<dyn SubjectModel>)
        }));
        let a = Pipeline::new(&config(), Some(segmenter.clone()), None);
        let b = Pipeline::new(&config(), Some(segmenter), None);
        a.process(&photo_source(100, 100)).await.unwrap();
        b.process(&photo_source(100, 100)).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
