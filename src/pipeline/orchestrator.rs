//! Turning an annotated composite into a generated illustration.

use image::{imageops, RgbaImage};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::image::{CompositeImage, GeneratedImage, SD_IMAGE_SIZE};

use super::bootstrap::ModelBundle;
use super::{ConditionedGenerator, EdgeDetector, GenerationRequest};

/// Positive prompt sent with every generation.
pub const PROMPT: &str = "A colorful image and high resolution image";

/// Negative prompt steering away from flat, washed-out output.
pub const NEGATIVE_PROMPT: &str = "monochrome, desaturated, low contrast";

/// Message of the error raised when generation is requested without input.
pub const NO_COMPOSITE_MESSAGE: &str = "No annotated lineart provided";

/// Output of one generation along with the edge map that conditioned it.
#[derive(Debug, Clone)]
pub struct Rendering {
    /// Edge map handed to the generator.
    pub edges: RgbaImage,
    /// First generated image.
    pub image: GeneratedImage,
}

/// Drives edge detection and conditioned generation for one composite.
pub struct Orchestrator<'a, D, G> {
    bundle: &'a ModelBundle<D, G>,
}

impl<'a, D, G> Orchestrator<'a, D, G>
where
    D: EdgeDetector,
    G: ConditionedGenerator,
{
    /// Borrow the models of `bundle`.
    #[must_use]
    pub const fn new(bundle: &'a ModelBundle<D, G>) -> Self {
        Self { bundle }
    }

    /// Generate an illustration from `composite` in `steps` denoising steps.
    ///
    /// Blocks until the generator returns, which may take seconds to
    /// minutes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when `composite` is `None`, whatever the
    /// step count. Detector and generator failures are returned unchanged.
    pub fn generate(
        &self,
        composite: Option<&CompositeImage>,
        steps: u32,
    ) -> Result<GeneratedImage> {
        self.render(composite, steps).map(|rendering| rendering.image)
    }

    /// Like [`Self::generate`], but also returns the edge map.
    ///
    /// # Errors
    ///
    /// See [`Self::generate`].
    pub fn render(&self, composite: Option<&CompositeImage>, steps: u32) -> Result<Rendering> {
        let composite =
            composite.ok_or_else(|| Error::InvalidInput(NO_COMPOSITE_MESSAGE.to_string()))?;

        let edges = self.detect_edges(composite)?;

        // Fresh generator per call: same inputs, same image
        let mut rng = StdRng::seed_from_u64(self.bundle.seed());

        let request = GenerationRequest {
            prompt: PROMPT,
            negative_prompt: NEGATIVE_PROMPT,
            control_image: &edges,
            num_inference_steps: steps,
        };

        tracing::info!("Generating with {steps} steps, seed {}", self.bundle.seed());
        let image = self
            .bundle
            .generator()
            .generate(&request, &mut rng)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "at least one generated image".to_string(),
                actual: "no images".to_string(),
            })?;

        Ok(Rendering { edges, image })
    }

    /// Resize `composite` to the model resolution and re-derive its lines.
    ///
    /// # Errors
    ///
    /// Returns the detector's error unchanged.
    pub fn detect_edges(&self, composite: &CompositeImage) -> Result<RgbaImage> {
        let resized = if composite.dimensions() == (SD_IMAGE_SIZE, SD_IMAGE_SIZE) {
            composite.clone()
        } else {
            imageops::resize(
                composite,
                SD_IMAGE_SIZE,
                SD_IMAGE_SIZE,
                crate::image::UPLOAD_FILTER,
            )
        };

        tracing::info!("Detecting lineart...");
        Ok(self.bundle.detector().detect(&resized)?.to_rgba8())
    }
}
