//! Sketch-to-illustration pipeline: upload, annotate, generate.

use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbaImage};

use crate::error::{Error, Result};
use crate::image::{
    load_brush_canvas, load_lineart, merge_overlay, save_image, BrushCanvas, CompositeImage,
    GeneratedImage, TARGET_SIZE,
};
use crate::model::{Device, ModelSource};

use super::bootstrap::{BootstrapOptions, ModelBundle};
use super::controlnet::GeneratorSettings;
use super::detector::DetectorKind;
use super::orchestrator::{Orchestrator, NO_COMPOSITE_MESSAGE};
use super::scheduler::SchedulerConfig;
use super::{ConditionedGenerator, EdgeDetector};

/// Configuration for the sketch coloring pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Compute device. `None` picks an accelerator if one is available.
    pub device: Option<Device>,

    /// Seed for the generator's random draws.
    pub seed: u64,

    /// Number of denoising steps. More steps = better quality but slower.
    pub num_inference_steps: u32,

    /// Size the lineart and brush canvas are brought to.
    pub size: (u32, u32),

    /// Edge detector used to re-derive lines from the composite.
    pub detector: DetectorKind,

    /// Classifier-free guidance scale.
    pub guidance_scale: f32,

    /// Weight of the `ControlNet` conditioning.
    pub conditioning_scale: f32,

    /// Local checkpoint directory. Downloads are disabled when set.
    pub model_dir: Option<PathBuf>,

    /// Where checkpoints are downloaded from.
    pub source: ModelSource,

    /// Output JPEG quality (1-100).
    pub output_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        let settings = GeneratorSettings::default();
        Self {
            device: None,
            seed: 0,
            num_inference_steps: 30,
            size: TARGET_SIZE,
            detector: DetectorKind::default(),
            guidance_scale: settings.guidance_scale,
            conditioning_scale: settings.conditioning_scale,
            model_dir: None,
            source: ModelSource::default(),
            output_quality: 95,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// The step count is left to the generator to judge.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.size.0 == 0 || self.size.1 == 0 {
            return Err(Error::InvalidParameter {
                name: "size".to_string(),
                reason: "width and height must be greater than 0".to_string(),
            });
        }

        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(Error::InvalidParameter {
                name: "guidance_scale".to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }

        if !self.conditioning_scale.is_finite() || self.conditioning_scale < 0.0 {
            return Err(Error::InvalidParameter {
                name: "conditioning_scale".to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }

        if !(1..=100).contains(&self.output_quality) {
            return Err(Error::InvalidParameter {
                name: "output_quality".to_string(),
                reason: "must be between 1 and 100".to_string(),
            });
        }

        Ok(())
    }

    /// Options for loading the models this configuration describes.
    #[must_use]
    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            detector: self.detector,
            generator: GeneratorSettings {
                guidance_scale: self.guidance_scale,
                conditioning_scale: self.conditioning_scale,
            },
            source: self.source.clone(),
            model_dir: self.model_dir.clone(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Where to write intermediate images, if anywhere.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Lineart overlay composited over the brush canvas.
    pub composite: Option<PathBuf>,
    /// Edge map the generator was conditioned on.
    pub edges: Option<PathBuf>,
}

/// Everything one generation produced.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Lineart overlay composited over the brush canvas.
    pub composite: CompositeImage,
    /// Edge map the generator was conditioned on.
    pub edges: RgbaImage,
    /// The generated illustration.
    pub image: GeneratedImage,
}

/// Lineart coloring pipeline.
pub struct Pipeline<D = super::Detector, G = super::ControlNetGenerator> {
    config: Config,
    bundle: ModelBundle<D, G>,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration.
    ///
    /// This will download models if they are not already cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or models cannot be
    /// loaded.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing pipeline with config: {config:?}");

        let bundle =
            ModelBundle::initialize(config.device, config.seed, &config.bootstrap_options())?;

        tracing::info!("Pipeline initialized successfully");

        Ok(Self { config, bundle })
    }
}

impl<D, G> Pipeline<D, G>
where
    D: EdgeDetector,
    G: ConditionedGenerator,
{
    /// Create a pipeline around already loaded models.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_bundle(config: Config, bundle: ModelBundle<D, G>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, bundle })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The loaded models.
    #[must_use]
    pub const fn bundle(&self) -> &ModelBundle<D, G> {
        &self.bundle
    }

    /// Orchestrator over this pipeline's models.
    #[must_use]
    pub const fn orchestrator(&self) -> Orchestrator<'_, D, G> {
        Orchestrator::new(&self.bundle)
    }

    /// Composite the lineart over the brush canvas and generate from it.
    ///
    /// Without a strokes file the canvas is the uploaded lineart itself, the
    /// way the sketchpad looks right after an upload. Blocks for the whole
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns an error if an image cannot be decoded or generation fails.
    pub fn run(&self, lineart: &Path, strokes: Option<&Path>) -> Result<Generation> {
        let size = self.config.size;

        tracing::info!("Processing lineart: {}", lineart.display());

        let canvas = match strokes {
            Some(path) => {
                tracing::info!("Loading brush strokes: {}", path.display());
                load_brush_canvas(path, size)?
            }
            None => load_lineart(Some(lineart), size)?
                .map(|img| BrushCanvas::from_lineart(&img))
                .ok_or_else(|| Error::InvalidInput(NO_COMPOSITE_MESSAGE.to_string()))?,
        };

        let composite = merge_overlay(Some(&canvas), Some(lineart), size)?
            .ok_or_else(|| Error::InvalidInput(NO_COMPOSITE_MESSAGE.to_string()))?;

        let rendering = self
            .orchestrator()
            .render(Some(&composite), self.config.num_inference_steps)?;

        Ok(Generation {
            composite,
            edges: rendering.edges,
            image: rendering.image,
        })
    }

    /// Generate from `lineart` (and optional `strokes`) and save the result.
    ///
    /// # Arguments
    ///
    /// * `lineart` - Path to the uploaded lineart sketch
    /// * `strokes` - Path to the painted RGBA strokes, if any
    /// * `output` - Path to save the generated image
    /// * `extras` - Where to save intermediate images
    ///
    /// # Errors
    ///
    /// Returns an error if processing or saving fails.
    pub fn process(
        &self,
        lineart: &Path,
        strokes: Option<&Path>,
        output: &Path,
        extras: &SaveOptions,
    ) -> Result<Generation> {
        let generation = self.run(lineart, strokes)?;
        let quality = self.config.output_quality;

        if let Some(path) = &extras.composite {
            tracing::info!("Saving composite to: {}", path.display());
            save_image(&DynamicImage::ImageRgba8(generation.composite.clone()), path, quality)?;
        }

        if let Some(path) = &extras.edges {
            tracing::info!("Saving edge map to: {}", path.display());
            save_image(&DynamicImage::ImageRgba8(generation.edges.clone()), path, quality)?;
        }

        tracing::info!("Saving output to: {}", output.display());
        save_image(&DynamicImage::ImageRgb8(generation.image.clone()), output, quality)?;

        tracing::info!("Processing complete");
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use ::image::{GrayImage, Luma, Rgb, Rgba, RgbImage};
    use rand::rngs::StdRng;
    use rand::Rng;

    use super::*;
    use crate::pipeline::{CannyDetector, GenerationRequest};

    /// Remembers every control image and paints noise at the model size.
    #[derive(Default)]
    struct RecordingGenerator {
        controls: RefCell<Vec<RgbaImage>>,
    }

    impl ConditionedGenerator for RecordingGenerator {
        fn generate(
            &self,
            request: &GenerationRequest<'_>,
            rng: &mut StdRng,
        ) -> Result<Vec<GeneratedImage>> {
            self.controls.borrow_mut().push(request.control_image.clone());
            let (w, h) = request.control_image.dimensions();
            Ok(vec![RgbImage::from_fn(w, h, |_, _| {
                Rgb([rng.random(), rng.random(), rng.random()])
            })])
        }
    }

    /// Rejects a zero step count like the ONNX generator does.
    struct StrictGenerator;

    impl ConditionedGenerator for StrictGenerator {
        fn generate(
            &self,
            request: &GenerationRequest<'_>,
            _: &mut StdRng,
        ) -> Result<Vec<GeneratedImage>> {
            if request.num_inference_steps == 0 {
                return Err(Error::InvalidParameter {
                    name: "num_inference_steps".to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
            Ok(vec![RgbImage::new(8, 8)])
        }
    }

    fn pipeline<G>(generator: G, config: Config) -> Pipeline<CannyDetector, G>
    where
        G: ConditionedGenerator,
    {
        let bundle = ModelBundle::from_parts(CannyDetector::default(), generator, Device::Cpu, config.seed);
        Pipeline::with_bundle(config, bundle).unwrap()
    }

    fn write(dir: &tempfile::TempDir, name: &str, img: DynamicImage) -> PathBuf {
        let path = dir.path().join(name);
        img.save(&path).unwrap();
        path
    }

    fn disk() -> GrayImage {
        GrayImage::from_fn(512, 512, |x, y| {
            let (dx, dy) = (f64::from(x) - 256.0, f64::from(y) - 256.0);
            if dx.hypot(dy) < 100.0 {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.seed, 0);
        assert_eq!(config.num_inference_steps, 30);
        assert_eq!(config.size, (512, 512));
        assert!(config.device.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            Config {
                output_quality: 0,
                ..Config::default()
            },
            Config {
                guidance_scale: f32::NAN,
                ..Config::default()
            },
            Config {
                conditioning_scale: -1.0,
                ..Config::default()
            },
            Config {
                size: (0, 512),
                ..Config::default()
            },
        ];

        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_validate_leaves_zero_steps_to_generator() {
        let config = Config {
            num_inference_steps: 0,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_white_upload_gives_empty_edge_map() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = write(
            &dir,
            "white.png",
            DynamicImage::ImageLuma8(GrayImage::from_pixel(512, 512, Luma([255]))),
        );
        let strokes = write(&dir, "blank.png", DynamicImage::ImageRgba8(RgbaImage::new(512, 512)));
        let pipeline = pipeline(RecordingGenerator::default(), Config::default());

        let generation = pipeline.run(&lineart, Some(&strokes)).unwrap();

        // Fully transparent overlay over a blank canvas
        assert!(generation.composite.pixels().all(|p| p[3] == 0));
        let controls = pipeline.bundle().generator().controls.borrow();
        assert_eq!(controls.len(), 1);
        assert!(controls[0].pixels().all(|p| p.0[..3] == [0, 0, 0]));
    }

    #[test]
    fn test_black_disk_is_kept_and_output_is_model_sized() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = write(&dir, "disk.png", DynamicImage::ImageLuma8(disk()));
        let strokes = write(&dir, "blank.png", DynamicImage::ImageRgba8(RgbaImage::new(512, 512)));
        let pipeline = pipeline(RecordingGenerator::default(), Config::default());

        let generation = pipeline.run(&lineart, Some(&strokes)).unwrap();

        assert_eq!(generation.composite.get_pixel(256, 256), &Rgba([0, 0, 0, 255]));
        assert_eq!(generation.composite.get_pixel(10, 10)[3], 0);
        assert!(generation.edges.pixels().any(|p| p[0] == 255));
        assert_eq!(generation.image.dimensions(), (512, 512));
    }

    #[test]
    fn test_red_stroke_inside_outline_stays_red() {
        let dir = tempfile::tempdir().unwrap();
        let outline = GrayImage::from_fn(512, 512, |x, y| {
            let (dx, dy) = (f64::from(x) - 256.0, f64::from(y) - 256.0);
            let r = dx.hypot(dy);
            if (150.0..160.0).contains(&r) {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        let lineart = write(&dir, "outline.png", DynamicImage::ImageLuma8(outline));
        let stroke = RgbaImage::from_fn(512, 512, |x, y| {
            if (200..312).contains(&x) && (240..272).contains(&y) {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        let strokes = write(&dir, "stroke.png", DynamicImage::ImageRgba8(stroke));
        let pipeline = pipeline(RecordingGenerator::default(), Config::default());

        let generation = pipeline.run(&lineart, Some(&strokes)).unwrap();

        assert_eq!(generation.composite.get_pixel(256, 256), &Rgba([255, 0, 0, 255]));
        assert_eq!(generation.composite.get_pixel(256 + 155, 256), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_without_strokes_canvas_is_the_lineart() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = write(&dir, "disk.png", DynamicImage::ImageLuma8(disk()));
        let pipeline = pipeline(RecordingGenerator::default(), Config::default());

        let generation = pipeline.run(&lineart, None).unwrap();

        assert_eq!(generation.composite.get_pixel(256, 256), &Rgba([0, 0, 0, 255]));
        assert_eq!(generation.composite.get_pixel(10, 10), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_runs_are_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = write(&dir, "disk.png", DynamicImage::ImageLuma8(disk()));
        let pipeline = pipeline(RecordingGenerator::default(), Config::default());

        let first = pipeline.run(&lineart, None).unwrap();
        let second = pipeline.run(&lineart, None).unwrap();

        assert_eq!(first.image, second.image);
    }

    #[test]
    fn test_zero_steps_is_rejected_by_generator() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = write(&dir, "disk.png", DynamicImage::ImageLuma8(disk()));
        let config = Config {
            num_inference_steps: 0,
            ..Config::default()
        };
        let pipeline = pipeline(StrictGenerator, config);

        let err = pipeline.run(&lineart, None).unwrap_err();
        assert!(
            matches!(err, Error::InvalidParameter { ref name, .. } if name == "num_inference_steps")
        );
    }

    #[test]
    fn test_undecodable_upload_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = dir.path().join("broken.png");
        std::fs::write(&lineart, b"nope").unwrap();
        let pipeline = pipeline(RecordingGenerator::default(), Config::default());

        let err = pipeline.run(&lineart, None).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        assert!(pipeline.bundle().generator().controls.borrow().is_empty());
    }

    #[test]
    fn test_process_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = write(&dir, "disk.png", DynamicImage::ImageLuma8(disk()));
        let output = dir.path().join("out.jpg");
        let extras = SaveOptions {
            composite: Some(dir.path().join("composite.png")),
            edges: Some(dir.path().join("edges.png")),
        };
        let pipeline = pipeline(RecordingGenerator::default(), Config::default());

        pipeline.process(&lineart, None, &output, &extras).unwrap();

        assert!(output.exists());
        assert!(dir.path().join("composite.png").exists());
        assert!(dir.path().join("edges.png").exists());
    }
}
