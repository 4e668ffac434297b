//! Lineart-conditioned generation pipeline.
//!
//! The heavy collaborators (edge detector, conditioned generator) sit behind
//! the [`EdgeDetector`] and [`ConditionedGenerator`] traits so the
//! orchestration can run against deterministic fakes.

mod bootstrap;
mod canny;
mod controlnet;
mod detector;
mod lineart;
mod orchestrator;
mod scheduler;
mod sketch;
mod text;
mod vae;

pub use bootstrap::{initialize, BootstrapOptions, ModelBundle};
pub use canny::CannyDetector;
pub use controlnet::{ControlNetGenerator, GeneratorSettings};
pub use detector::{Detector, DetectorKind};
pub use lineart::LineartDetector;
pub use orchestrator::{
    Orchestrator, Rendering, NEGATIVE_PROMPT, NO_COMPOSITE_MESSAGE, PROMPT,
};
pub use scheduler::{MultistepScheduler, SchedulerConfig, Solver};
pub use sketch::{Config, Generation, Pipeline, SaveOptions};
pub use text::PromptEncoder;

use image::{DynamicImage, RgbImage, RgbaImage};
use rand::rngs::StdRng;

use crate::error::Result;
use crate::image::GeneratedImage;

/// Re-derives clean lines from an annotated sketch.
pub trait EdgeDetector {
    /// Detect edges in `image`.
    ///
    /// Returns white lines on black, the polarity `ControlNet` expects.
    /// This is a blocking call that may run a neural network.
    ///
    /// # Errors
    ///
    /// Returns an error if the detector fails; callers pass it on unchanged.
    fn detect(&self, image: &RgbaImage) -> Result<DynamicImage>;
}

/// Everything a conditioned generator needs for one request.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// What the image should look like.
    pub prompt: &'a str,
    /// What the image should avoid.
    pub negative_prompt: &'a str,
    /// Edge map constraining the composition.
    pub control_image: &'a RgbaImage,
    /// Number of denoising steps, passed through unvalidated.
    pub num_inference_steps: u32,
}

/// Generates images from a prompt and a conditioning image.
pub trait ConditionedGenerator {
    /// Generate images for `request`, drawing all randomness from `rng`.
    ///
    /// Returns an ordered collection; callers use the first entry. This is a
    /// blocking call that may take seconds to minutes.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails; callers pass it on unchanged.
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        rng: &mut StdRng,
    ) -> Result<Vec<GeneratedImage>>;
}

/// Flatten RGBA onto a white background, the way the annotators read input.
#[must_use]
pub(crate) fn flatten_on_white(rgba: &RgbaImage) -> RgbImage {
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in rgb.pixels_mut().zip(rgba.pixels()) {
        let alpha = u32::from(src[3]);
        for c in 0..3 {
            let blended = (u32::from(src[c]) * alpha + 255 * (255 - alpha) + 127) / 255;
            // Safe: a convex combination of two u8 values stays within u8
            dst[c] = u8::try_from(blended).unwrap_or(u8::MAX);
        }
    }
    rgb
}
