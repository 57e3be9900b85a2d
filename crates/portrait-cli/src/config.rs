use anyhow::{Context, Result};
use portrait_core::{CropPolicy, PipelineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upload ceiling enforced before the pipeline sees any bytes.
pub const DEFAULT_MAX_INPUT_BYTES: u64 = 10 * 1024 * 1024;

/// CLI configuration: pipeline tunables plus model locations.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub pipeline: PipelineConfig,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Matting model; defaults to `modnet.onnx` in `model_dir`.
    pub segmentation_model: Option<PathBuf>,
    /// SCRFD model; defaults to `det_10g.onnx` in `model_dir`.
    pub detection_model: Option<PathBuf>,
    /// Matting network input side.
    pub segmentation_input: u32,
    pub max_input_bytes: u64,
}

/// On-disk layout: `[pipeline]` plus a `[models]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    pipeline: PipelineConfig,
    models: ModelsSection,
    max_input_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelsSection {
    dir: Option<PathBuf>,
    segmentation: Option<PathBuf>,
    detection: Option<PathBuf>,
    segmentation_input: Option<u32>,
}

impl Config {
    /// Load from an optional TOML file, then apply `PORTRAIT_*` environment overrides.
    ///
    /// Without an explicit path, `PORTRAIT_CONFIG` is consulted.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("PORTRAIT_CONFIG").ok().map(PathBuf::from));

        let file = match &path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config {}", p.display()))?;
                Self::parse_file(&text).with_context(|| format!("invalid config {}", p.display()))?
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file);
        config.apply_env();
        Ok(config)
    }

    fn parse_file(text: &str) -> Result<ConfigFile> {
        Ok(toml::from_str(text)?)
    }

    fn from_file(file: ConfigFile) -> Self {
        Self {
            pipeline: file.pipeline,
            model_dir: file.models.dir.unwrap_or_else(default_model_dir),
            segmentation_model: file.models.segmentation,
            detection_model: file.models.detection,
            segmentation_input: file
                .models
                .segmentation_input
                .unwrap_or(portrait_core::segmenter::MATTING_INPUT_SIZE),
            max_input_bytes: file.max_input_bytes.unwrap_or(DEFAULT_MAX_INPUT_BYTES),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("PORTRAIT_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Ok(p) = std::env::var("PORTRAIT_SEGMENTATION_MODEL") {
            self.segmentation_model = Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("PORTRAIT_DETECTION_MODEL") {
            self.detection_model = Some(PathBuf::from(p));
        }
        if let Ok(policy) = std::env::var("PORTRAIT_CROP_POLICY") {
            match parse_policy(&policy) {
                Some(p) => self.pipeline.crop_policy = p,
                None => tracing::warn!(value = %policy, "ignoring unknown PORTRAIT_CROP_POLICY"),
            }
        }

        let p = &mut self.pipeline;
        p.max_side = env_or("PORTRAIT_MAX_SIDE", p.max_side);
        p.min_side = env_or("PORTRAIT_MIN_SIDE", p.min_side);
        p.output_side = env_or("PORTRAIT_OUTPUT_SIDE", p.output_side);
        p.face_scale = env_or("PORTRAIT_FACE_SCALE", p.face_scale);
        p.quality_samples = env_or("PORTRAIT_QUALITY_SAMPLES", p.quality_samples);
        p.model_timeout_secs = env_or("PORTRAIT_MODEL_TIMEOUT_SECS", p.model_timeout_secs);
        p.isolate = std::env::var("PORTRAIT_ISOLATE")
            .map(|v| v != "0")
            .unwrap_or(p.isolate);

        self.max_input_bytes = env_or("PORTRAIT_MAX_INPUT_BYTES", self.max_input_bytes);
    }

    /// Path to the matting model.
    pub fn segmentation_model_path(&self) -> PathBuf {
        self.segmentation_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join("modnet.onnx"))
    }

    /// Path to the SCRFD detection model.
    pub fn detection_model_path(&self) -> PathBuf {
        self.detection_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join("det_10g.onnx"))
    }
}

pub fn parse_policy(value: &str) -> Option<CropPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "centered" | "center" => Some(CropPolicy::Centered),
        "subject-aware" | "subject" | "face" => Some(CropPolicy::SubjectAware),
        _ => None,
    }
}

/// `$XDG_DATA_HOME/portrait/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("portrait/models")
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
