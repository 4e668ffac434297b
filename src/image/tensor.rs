//! Conversions between RGB images and NCHW tensors.

use image::{Rgb, RgbImage};
use ndarray::Array4;

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Value range of a normalized image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRange {
    /// `[0, 1]`, used by the annotators and `ControlNet` conditioning.
    Unit,
    /// `[-1, 1]`, used by the VAE.
    Signed,
}

impl TensorRange {
    #[inline]
    fn normalize(self, value: u8) -> f32 {
        match self {
            Self::Unit => f32::from(value) / 255.0,
            Self::Signed => (f32::from(value) / 127.5) - 1.0,
        }
    }

    /// Map a tensor value back to `[0, 255]` with clamping.
    #[inline]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn denormalize(self, value: f32) -> u8 {
        let scaled = match self {
            Self::Unit => value * 255.0,
            Self::Signed => (value + 1.0) * 127.5,
        };
        // Safe: clamped to [0, 255] range before casting
        scaled.round().clamp(0.0, 255.0) as u8
    }
}

/// Convert an RGB image to a `(1, 3, H, W)` tensor in the given range.
#[must_use]
pub fn image_to_tensor(img: &RgbImage, range: TensorRange) -> ImageTensor {
    let (width, height) = (img.width() as usize, img.height() as usize);

    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height, width));

    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            tensor[[0, c, y, x]] = range.normalize(pixel[c]);
        }
    }

    tensor
}

/// Convert the first image of an NCHW tensor back to RGB.
///
/// Single-channel tensors are broadcast to gray.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the tensor has neither 1 nor 3 channels.
#[allow(clippy::cast_possible_truncation)]
pub fn tensor_to_image(tensor: &ImageTensor, range: TensorRange) -> Result<RgbImage> {
    let (_, channels, height, width) = tensor.dim();
    if channels != 1 && channels != RGB_CHANNELS {
        return Err(Error::ShapeMismatch {
            expected: "1 or 3 channels".to_string(),
            actual: format!("{channels} channels"),
        });
    }

    // Safe: tensor dimensions come from images whose sides fit in u32
    let mut img = RgbImage::new(width as u32, height as u32);

    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let (xi, yi) = (x as usize, y as usize);
        let channel = |c: usize| range.denormalize(tensor[[0, c.min(channels - 1), yi, xi]]);
        *pixel = Rgb([channel(0), channel(1), channel(2)]);
    }

    Ok(img)
}
