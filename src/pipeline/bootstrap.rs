//! One-time model loading at process start.

use std::path::PathBuf;

use crate::error::Result;
use crate::model::{Device, ModelCache, ModelSource, ModelType, Precision, SharedSession};

use super::controlnet::{self, ControlNetGenerator, GeneratorSettings};
use super::detector::{Detector, DetectorKind};
use super::scheduler::{MultistepScheduler, SchedulerConfig};
use super::text::PromptEncoder;
use super::{CannyDetector, LineartDetector};

/// Everything `initialize` needs besides the device and seed.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Which edge detector to load.
    pub detector: DetectorKind,
    /// Sampling settings of the generator.
    pub generator: GeneratorSettings,
    /// Where to download checkpoints from.
    pub source: ModelSource,
    /// Local checkpoint directory; disables downloads when set.
    ///
    /// Generation needs a `ControlNet`-capable `UNet`, which has no default
    /// download, so either this or `source.control_repo` must provide it.
    pub model_dir: Option<PathBuf>,
    /// Noise schedule of the base model.
    pub scheduler: SchedulerConfig,
}

/// The loaded models, bound to one device for the life of the process.
///
/// Shared read-only by every request. Generic so tests can swap in fakes.
pub struct ModelBundle<D = Detector, G = ControlNetGenerator> {
    detector: D,
    generator: G,
    device: Device,
    precision: Precision,
    seed: u64,
}

impl ModelBundle {
    /// Select the device and load every model onto it.
    ///
    /// Downloads missing checkpoints first. Run once per process; any failure
    /// is fatal to startup.
    ///
    /// # Errors
    ///
    /// Returns an error if any checkpoint cannot be downloaded or loaded.
    pub fn initialize(device: Option<Device>, seed: u64, options: &BootstrapOptions) -> Result<Self> {
        let device = Device::select(device);
        let precision = device.precision();
        tracing::info!("Initializing models on {device} ({precision:?} precision)");

        let cache = match &options.model_dir {
            Some(dir) => ModelCache::local(dir),
            None => ModelCache::new(options.source.clone())?,
        };
        tracing::debug!("Model directory: {}", cache.dir().display());

        let detector = match options.detector {
            DetectorKind::Lineart => {
                tracing::info!("Loading lineart detector...");
                Detector::Lineart(LineartDetector::new(load(&cache, ModelType::LineartDetector, device)?))
            }
            DetectorKind::Canny => Detector::Canny(CannyDetector::default()),
        };

        tracing::info!("Loading text encoder...");
        let prompts = PromptEncoder::load(
            &cache.get_tokenizer_path()?,
            load(&cache, ModelType::TextEncoder, device)?,
        )?;

        tracing::info!("Loading ControlNet...");
        let controlnet = load(&cache, ModelType::ControlNet, device)?;

        tracing::info!("Loading `UNet`...");
        let unet = load(&cache, ModelType::Unet, device)?;
        controlnet::check_residual_wiring(&controlnet, &unet)?;

        tracing::info!("Loading VAE decoder...");
        let vae_decoder = load(&cache, ModelType::VaeDecoder, device)?;

        let scheduler = MultistepScheduler::from_config(&options.scheduler);

        let generator = ControlNetGenerator::new(
            prompts,
            controlnet,
            unet,
            vae_decoder,
            scheduler,
            options.generator,
        );

        tracing::info!("Models initialized successfully");

        Ok(Self {
            detector,
            generator,
            device,
            precision,
            seed,
        })
    }
}

impl<D, G> ModelBundle<D, G> {
    /// Assemble a bundle from already constructed parts.
    #[must_use]
    pub const fn from_parts(detector: D, generator: G, device: Device, seed: u64) -> Self {
        Self {
            detector,
            generator,
            device,
            precision: device.precision(),
            seed,
        }
    }

    /// The edge detector.
    #[must_use]
    pub const fn detector(&self) -> &D {
        &self.detector
    }

    /// The conditioned generator.
    #[must_use]
    pub const fn generator(&self) -> &G {
        &self.generator
    }

    /// Device the models run on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Precision of the loaded checkpoints.
    #[must_use]
    pub const fn precision(&self) -> Precision {
        self.precision
    }

    /// Seed every generation starts from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }
}

/// Load the bundle with default options. See [`ModelBundle::initialize`].
///
/// # Errors
///
/// Returns an error if any checkpoint cannot be downloaded or loaded.
pub fn initialize(device: Option<Device>, seed: u64) -> Result<ModelBundle> {
    ModelBundle::initialize(device, seed, &BootstrapOptions::default())
}

fn load(cache: &ModelCache, model_type: ModelType, device: Device) -> Result<SharedSession> {
    let session = cache.load_session(model_type, device)?;
    Ok(SharedSession::new(model_type.dir_name(), session))
}
