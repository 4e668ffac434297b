//! `ControlNet`-conditioned Stable Diffusion generation.

use image::RgbaImage;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, s, Array3, Array4, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::image::{image_to_tensor, tensor_to_image, GeneratedImage, TensorRange};
use crate::model::session::{self, Inputs, SharedSession};

use super::scheduler::MultistepScheduler;
use super::text::PromptEncoder;
use super::vae::{self, LatentTensor, LATENT_CHANNELS, LATENT_FACTOR};
use super::{flatten_on_white, ConditionedGenerator, GenerationRequest};

/// `UNet` inputs that are not `ControlNet` residuals.
const UNET_BASE_INPUTS: [&str; 3] = ["sample", "timestep", "encoder_hidden_states"];

/// Sampling knobs of the generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorSettings {
    /// Classifier-free guidance scale.
    pub guidance_scale: f32,
    /// Weight of the `ControlNet` residuals.
    pub conditioning_scale: f32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            guidance_scale: 7.5,
            conditioning_scale: 1.0,
        }
    }
}

/// Stable Diffusion 1.5 guided by the lineart `ControlNet`.
pub struct ControlNetGenerator {
    prompts: PromptEncoder,
    controlnet: SharedSession,
    unet: SharedSession,
    vae_decoder: SharedSession,
    scheduler: MultistepScheduler,
    settings: GeneratorSettings,
}

impl ControlNetGenerator {
    /// Assemble a generator from loaded parts.
    #[must_use]
    pub const fn new(
        prompts: PromptEncoder,
        controlnet: SharedSession,
        unet: SharedSession,
        vae_decoder: SharedSession,
        scheduler: MultistepScheduler,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            prompts,
            controlnet,
            unet,
            vae_decoder,
            scheduler,
            settings,
        }
    }

    /// Sampling settings in use.
    #[must_use]
    pub const fn settings(&self) -> GeneratorSettings {
        self.settings
    }

    /// Run the `ControlNet` and return its residuals in output order.
    fn control_residuals(
        &self,
        latent_input: &Array4<f32>,
        timestep: i64,
        hidden_states: &Array3<f32>,
        control: &Array4<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        let model = self.controlnet.name();
        let batch = latent_input.dim().0;

        let mut session = self.controlnet.lock()?;
        let declared = session::input_names(&session);
        let timestep_type = session::input_element_type(&session, "timestep");

        let mut inputs: Inputs = Vec::with_capacity(declared.len());
        for name in declared {
            let value = match name.as_str() {
                "sample" => session::float_input(model, latent_input.clone())?,
                "timestep" => {
                    session::integer_input(model, timestep_type, &[batch], &vec![timestep; batch])?
                }
                "encoder_hidden_states" => session::float_input(model, hidden_states.clone())?,
                "controlnet_cond" => session::float_input(model, control.clone())?,
                "conditioning_scale" => session::float_input(
                    model,
                    ndarray::arr1(&[self.settings.conditioning_scale]),
                )?,
                other => {
                    return Err(Error::InvalidParameter {
                        name: other.to_string(),
                        reason: format!("{model} input is not supported"),
                    })
                }
            };
            inputs.push((name, value));
        }
        let scaled_in_graph = inputs.iter().any(|(name, _)| name == "conditioning_scale");

        let residuals = session::run_locked(model, &mut session, inputs)?;

        if scaled_in_graph {
            Ok(residuals)
        } else {
            let scale = self.settings.conditioning_scale;
            Ok(residuals.into_iter().map(|r| r * scale).collect())
        }
    }

    /// Predict noise for the guidance batch, fed with `ControlNet` residuals.
    fn predict_noise(
        &self,
        latent_input: Array4<f32>,
        timestep: i64,
        hidden_states: Array3<f32>,
        residuals: Vec<ArrayD<f32>>,
    ) -> Result<Array4<f32>> {
        let model = self.unet.name();
        let batch = latent_input.dim().0;

        let mut session = self.unet.lock()?;
        let declared = session::input_names(&session);
        let timestep_type = session::input_element_type(&session, "timestep");

        let residual_names = residual_input_names(&declared);
        if residual_names.len() != residuals.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} ControlNet residual inputs", residuals.len()),
                actual: format!("{} residual inputs on {model}", residual_names.len()),
            });
        }

        let mut inputs: Inputs = vec![
            (
                "sample".to_string(),
                session::float_input(model, latent_input)?,
            ),
            (
                "timestep".to_string(),
                session::integer_input(model, timestep_type, &[batch], &vec![timestep; batch])?,
            ),
            (
                "encoder_hidden_states".to_string(),
                session::float_input(model, hidden_states)?,
            ),
        ];
        for (name, residual) in residual_names.into_iter().zip(residuals) {
            inputs.push((name, session::float_input(model, residual)?));
        }

        let output = session::run_locked(model, &mut session, inputs)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "noise prediction output".to_string(),
                actual: "no output".to_string(),
            })?;

        session::into_array4(output)
    }
}

impl ConditionedGenerator for ControlNetGenerator {
    /// Run text encoding, the denoising loop, and VAE decoding.
    ///
    /// This blocks for seconds on an accelerator and minutes on a CPU.
    #[allow(clippy::cast_possible_wrap)]
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        rng: &mut StdRng,
    ) -> Result<Vec<GeneratedImage>> {
        let steps = request.num_inference_steps;
        if steps == 0 {
            return Err(Error::InvalidParameter {
                name: "num_inference_steps".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        tracing::info!("Encoding prompts...");
        let negative = self.prompts.encode(request.negative_prompt)?;
        let positive = self.prompts.encode(request.prompt)?;
        let hidden_states = stack(&negative.view(), &positive.view())?;

        let control = image_to_tensor(
            &flatten_on_white(request.control_image),
            TensorRange::Unit,
        );
        let control = stack(&control.view(), &control.view())?;

        let mut latents = initial_latents(request.control_image, rng)
            * self.scheduler.init_noise_sigma();

        tracing::info!("Running diffusion...");
        let mut solver = self.scheduler.begin(steps);
        let timesteps = solver.timesteps().to_vec();

        // Progress bar for denoising
        let pb = ProgressBar::new(timesteps.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} Denoising [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("valid template")
                .progress_chars("#>-"),
        );

        for t in timesteps {
            // Safe: training timesteps are below 1000
            let timestep = t as i64;
            let latent_input = stack(&latents.view(), &latents.view())?;

            let residuals =
                self.control_residuals(&latent_input, timestep, &hidden_states, &control)?;
            let noise_pred =
                self.predict_noise(latent_input, timestep, hidden_states.clone(), residuals)?;

            let guided = guide(&noise_pred, self.settings.guidance_scale);
            latents = solver.step(&guided, &latents);

            pb.inc(1);
        }

        pb.finish_with_message("Denoising complete");

        tracing::info!("Decoding from latent space...");
        let decoded = vae::decode(&self.vae_decoder, &latents)?;

        Ok(vec![tensor_to_image(&decoded, TensorRange::Signed)?])
    }
}

/// `UNet` inputs that take residuals: everything past the base inputs, in
/// `ControlNet` output order.
fn residual_input_names(declared: &[String]) -> Vec<String> {
    declared
        .iter()
        .filter(|name| !UNET_BASE_INPUTS.contains(&name.as_str()))
        .cloned()
        .collect()
}

/// Check that `unet` takes one residual input per `controlnet` output.
///
/// # Errors
///
/// Returns [`Error::IncompatibleModels`] if the counts differ, as they do for
/// a plain `UNet` export without residual inputs.
pub(crate) fn check_residual_wiring(controlnet: &SharedSession, unet: &SharedSession) -> Result<()> {
    let outputs = session::output_count(&*controlnet.lock()?);
    let inputs = residual_input_names(&session::input_names(&*unet.lock()?)).len();
    check_residual_counts(outputs, inputs)
}

fn check_residual_counts(controlnet_outputs: usize, unet_residual_inputs: usize) -> Result<()> {
    if controlnet_outputs == 0 || controlnet_outputs != unet_residual_inputs {
        return Err(Error::IncompatibleModels {
            controlnet_outputs,
            unet_residual_inputs,
        });
    }
    Ok(())
}

/// Stack two batch-1 tensors into a batch of two (negative first).
fn stack<D: ndarray::RemoveAxis>(
    first: &ndarray::ArrayView<'_, f32, D>,
    second: &ndarray::ArrayView<'_, f32, D>,
) -> Result<ndarray::Array<f32, D>> {
    concatenate(Axis(0), &[first.view(), second.view()]).map_err(|err| Error::ShapeMismatch {
        expected: format!("{:?}", first.shape()),
        actual: format!("{:?} ({err})", second.shape()),
    })
}

/// Draw standard normal latents sized for `control`.
fn initial_latents(control: &RgbaImage, rng: &mut StdRng) -> LatentTensor {
    let height = (control.height() / LATENT_FACTOR) as usize;
    let width = (control.width() / LATENT_FACTOR) as usize;

    Array4::from_shape_fn((1, LATENT_CHANNELS, height, width), |_| {
        rng.sample::<f32, _>(StandardNormal)
    })
}

/// Classifier-free guidance over a [negative, positive] batch.
fn guide(noise_pred: &Array4<f32>, scale: f32) -> Array4<f32> {
    let uncond = noise_pred.slice(s![0..1, .., .., ..]);
    let text = noise_pred.slice(s![1..2, .., .., ..]);

    &uncond + &((&text - &uncond) * scale)
}
