use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use portrait_core::decoder::ImageDecoder;
use portrait_core::detector::FaceDetector;
use portrait_core::segmenter::MattingSegmenter;
use portrait_core::{
    Bitmap, CropPolicy, CropRect, ModelHandle, Pipeline, PipelineConfig, SourceImage, SubjectModel,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "portrait", about = "ID-card portrait processing")]
struct Cli {
    /// TOML configuration file (default: $PORTRAIT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a photo into a square portrait
    Process {
        input: PathBuf,
        /// Output PNG path
        #[arg(short, long, default_value = "processed_portrait.png")]
        output: PathBuf,
        /// Crop policy (default from config)
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
        /// Skip background replacement
        #[arg(long)]
        no_isolate: bool,
    },
    /// Re-crop an image (typically a processed portrait) by hand.
    ///
    /// Coordinates are in source pixels; the image is not downscaled first.
    Crop {
        input: PathBuf,
        #[arg(long)]
        left: u32,
        #[arg(long)]
        top: u32,
        #[arg(long)]
        size: u32,
        #[arg(short, long, default_value = "portrait.png")]
        output: PathBuf,
    },
    /// Decode a photo and report what the pipeline sees
    Inspect { input: PathBuf },
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Largest centered square
    Centered,
    /// Square framed on the detected face
    SubjectAware,
}

impl From<PolicyArg> for CropPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Centered => CropPolicy::Centered,
            PolicyArg::SubjectAware => CropPolicy::SubjectAware,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Process {
            input,
            output,
            policy,
            no_isolate,
        } => {
            if let Some(policy) = policy {
                config.pipeline.crop_policy = policy.into();
            }
            if no_isolate {
                config.pipeline.isolate = false;
            }

            let source = read_source(&input, config.max_input_bytes)?;
            let pipeline = build_pipeline(&config);
            let processed = pipeline.process_detailed(&source).await?;

            processed
                .portrait
                .save_png(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;

            println!(
                "{} -> {} ({}px, crop {}+{} {}px, isolation: {})",
                input.display(),
                output.display(),
                processed.portrait.side(),
                processed.crop.left,
                processed.crop.top,
                processed.crop.size,
                serde_json::to_string(&processed.outcome)?,
            );
        }
        Commands::Crop {
            input,
            left,
            top,
            size,
            output,
        } => {
            let source = read_source(&input, config.max_input_bytes)?;
            let pipeline = Pipeline::new(&config.pipeline, None, None);
            let bitmap = crop_decoder(&config.pipeline).decode(&source)?;
            let portrait = pipeline.recompose(&bitmap, CropRect::new(left, top, size))?;
            portrait
                .save_png(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("{} -> {} ({}px)", input.display(), output.display(), portrait.side());
        }
        Commands::Inspect { input } => {
            let source = read_source(&input, config.max_input_bytes)?;
            let pipeline = Pipeline::new(&config.pipeline, None, None);
            let bitmap = pipeline.decoder().decode(&source)?;
            println!("{}", serde_json::to_string_pretty(&inspect(&config, &source, &bitmap))?);
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.pipeline)?);
            println!("# model dir: {}", config.model_dir.display());
            println!("# segmentation model: {}", config.segmentation_model_path().display());
            println!("# detection model: {}", config.detection_model_path().display());
        }
    }

    Ok(())
}

/// Read an upload, enforcing the byte ceiling and guessing its media type.
fn read_source(path: &Path, max_bytes: u64) -> Result<SourceImage> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("cannot open {}", path.display()))?
        .len();
    if len > max_bytes {
        bail!("{} is {len} bytes; the limit is {max_bytes}", path.display());
    }
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let media_type = image::ImageFormat::from_path(path)
        .ok()
        .map(|f| f.to_mime_type().to_string());
    Ok(SourceImage::new(bytes, media_type))
}

/// Decoder for manual crops: same bounds, source resolution kept.
fn crop_decoder(pipeline: &PipelineConfig) -> ImageDecoder {
    ImageDecoder::new(pipeline.decode_limits().without_downscale())
}

/// Wire model handles into a pipeline. Models load lazily on first use; a
/// missing file only disables the corresponding step.
fn build_pipeline(config: &Config) -> Pipeline {
    let p = &config.pipeline;

    let segmenter = p.isolate.then(|| {
        let path = config.segmentation_model_path().to_string_lossy().into_owned();
        let input = config.segmentation_input;
        Arc::new(ModelHandle::new("matting", move || {
            Ok(Box::new(MattingSegmenter::load(&path, input)?) as Box<dyn SubjectModel>)
        }))
    });

    let detector = (p.crop_policy == CropPolicy::SubjectAware).then(|| {
        let path = config.detection_model_path().to_string_lossy().into_owned();
        Arc::new(ModelHandle::new("scrfd", move || {
            Ok(Box::new(FaceDetector::load(&path)?) as Box<dyn SubjectModel>)
        }))
    });

    Pipeline::new(p, segmenter, detector)
}

fn inspect(config: &Config, source: &SourceImage, bitmap: &Bitmap) -> serde_json::Value {
    let report = config
        .pipeline
        .quality_gate()
        .evaluate(bitmap, config.pipeline.quality_samples);
    serde_json::json!({
        "bytes": source.len(),
        "media_type": source.media_type(),
        "width": bitmap.width(),
        "height": bitmap.height(),
        "near_white": report.near_white,
        "acceptable": report.acceptable,
    })
}
