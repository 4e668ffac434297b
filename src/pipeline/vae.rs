//! Variational Autoencoder decoding of denoised latents.

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::model::session::{self, SharedSession};

/// Latent tensor type (1, 4, 64, 64) for 512x512 images.
pub type LatentTensor = ndarray::Array4<f32>;

/// VAE scaling factor (from Stable Diffusion).
pub const VAE_SCALE: f32 = 0.18215;

/// Spatial downsampling between image and latent space.
pub const LATENT_FACTOR: u32 = 8;

/// Number of latent channels.
pub const LATENT_CHANNELS: usize = 4;

/// Decode latents back to image space using the VAE decoder.
///
/// # Arguments
///
/// * `decoder` - ONNX session for the VAE decoder
/// * `latent` - Latent tensor in NCHW format (1, 4, 64, 64)
///
/// # Returns
///
/// Image tensor in NCHW format with values in [-1, 1].
///
/// # Errors
///
/// Returns an error if inference fails.
pub fn decode(decoder: &SharedSession, latent: &LatentTensor) -> Result<ImageTensor> {
    // Unscale latents
    let unscaled = latent / VAE_SCALE;

    let mut session = decoder.lock()?;
    let input_name = session::input_names(&session)
        .into_iter()
        .next()
        .unwrap_or_else(|| "latent_sample".to_string());
    let input = session::float_input(decoder.name(), unscaled)?;

    let outputs = session::run_locked(decoder.name(), &mut session, vec![(input_name, input)])?;

    // Get first output
    let output = outputs
        .into_iter()
        .next()
        .ok_or_else(|| Error::ShapeMismatch {
            expected: "sample output".to_string(),
            actual: "no output".to_string(),
        })?;

    session::into_array4(output)
}
