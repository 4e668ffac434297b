//! `SketchColor` CLI - Color lineart sketches with `ControlNet`-guided diffusion.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sketchcolor::model::{Device, ModelSource};
use sketchcolor::pipeline::{DetectorKind, SaveOptions};
use sketchcolor::{Config, Pipeline};

/// Color a lineart sketch, optionally guided by painted brush strokes.
#[derive(Parser, Debug)]
#[command(name = "sketchcolor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Lineart sketch path (dark lines on a light background).
    #[arg(value_name = "LINEART")]
    lineart: PathBuf,

    /// Output image path.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// RGBA image with painted brush strokes. Defaults to the sketch itself.
    #[arg(long, value_name = "PATH")]
    strokes: Option<PathBuf>,

    /// Number of denoising steps. More steps = better quality but slower.
    #[arg(long, default_value = "30", value_name = "INT")]
    steps: u32,

    /// Random seed for reproducibility.
    #[arg(long, default_value = "0", value_name = "INT")]
    seed: u64,

    /// Compute device: cpu, cuda or cuda:N. Picks CUDA when available.
    #[arg(long, value_name = "DEVICE")]
    device: Option<Device>,

    /// Edge detector: lineart (neural) or canny (no download).
    #[arg(long, default_value = "lineart", value_name = "NAME")]
    detector: DetectorKind,

    /// Classifier-free guidance scale.
    #[arg(long, default_value = "7.5", value_name = "FLOAT")]
    guidance_scale: f32,

    /// Load checkpoints from this directory instead of downloading them.
    ///
    /// Layout: `<fp32|fp16>/<lineart|text_encoder|controlnet|unet|vae_decoder>/model.onnx`
    /// plus `tokenizer.json`. The `UNet` must take `ControlNet` residual inputs.
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Base URL to download the lineart annotator, `ControlNet` and residual
    /// `UNet` exports from. Needed unless they are cached or `--model-dir` is set.
    #[arg(long, value_name = "URL", conflicts_with = "model_dir")]
    control_repo: Option<String>,

    /// Output JPEG quality (1-100).
    #[arg(short, long, default_value = "95", value_name = "INT")]
    quality: u8,

    /// Also save the lineart composite to this path.
    #[arg(long, value_name = "PATH")]
    save_composite: Option<PathBuf>,

    /// Also save the detected edge map to this path.
    #[arg(long, value_name = "PATH")]
    save_edges: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sketchcolor={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(&args) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: &Args) -> Result<()> {
    if !args.lineart.exists() {
        anyhow::bail!("Lineart file does not exist: {}", args.lineart.display());
    }
    if let Some(strokes) = &args.strokes {
        if !strokes.exists() {
            anyhow::bail!("Strokes file does not exist: {}", strokes.display());
        }
    }

    let config = Config {
        device: args.device,
        seed: args.seed,
        num_inference_steps: args.steps,
        detector: args.detector,
        guidance_scale: args.guidance_scale,
        model_dir: args.model_dir.clone(),
        source: ModelSource {
            control_repo: args.control_repo.clone(),
            ..ModelSource::default()
        },
        output_quality: args.quality,
        ..Config::default()
    };

    let pipeline = Pipeline::new(config).context("Failed to initialize pipeline")?;

    let extras = SaveOptions {
        composite: args.save_composite.clone(),
        edges: args.save_edges.clone(),
    };

    pipeline
        .process(&args.lineart, args.strokes.as_deref(), &args.output, &extras)
        .context("Failed to color sketch")?;

    println!(
        "Successfully colored {} -> {}",
        args.lineart.display(),
        args.output.display()
    );

    Ok(())
}
