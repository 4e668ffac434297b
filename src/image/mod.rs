//! Image loading, compositing, tensor conversion, and saving utilities.

mod composite;
mod load;
mod save;
mod tensor;

pub use composite::{merge_overlay, overlay_mask, threshold_pixel, BrushCanvas};
pub use load::{load_brush_canvas, load_lineart};
pub(crate) use load::UPLOAD_FILTER;
pub use save::save_image;
pub use tensor::{image_to_tensor, tensor_to_image, TensorRange};

use ndarray::Array4;

/// Grayscale lineart buffer, black lines on a white background.
pub type LineartImage = image::GrayImage;

/// Lineart overlay drawn over the user's brush canvas.
pub type CompositeImage = image::RgbaImage;

/// Final RGB output of the conditioned generator.
pub type GeneratedImage = image::RgbImage;

/// Image tensor in NCHW format (batch, channels, height, width).
pub type ImageTensor = Array4<f32>;

/// Native resolution of Stable Diffusion 1.5 and its `ControlNet`s.
pub const SD_IMAGE_SIZE: u32 = 512;

/// Default working size for uploaded lineart and the brush canvas.
pub const TARGET_SIZE: (u32, u32) = (SD_IMAGE_SIZE, SD_IMAGE_SIZE);

/// Luma values above this count as paper, not ink.
pub const WHITE_THRESHOLD: u8 = 240;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;
