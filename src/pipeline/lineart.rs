//! Neural lineart annotator.

use image::{imageops, DynamicImage, GrayImage, Luma, RgbaImage};
use ndarray::Array4;

use crate::error::{Error, Result};
use crate::image::{image_to_tensor, TensorRange};
use crate::model::session::{self, SharedSession};

use super::{flatten_on_white, EdgeDetector};

/// Extracts clean lineart from a sketch with the `ControlNet` lineart
/// annotator.
pub struct LineartDetector {
    session: SharedSession,
}

impl LineartDetector {
    /// Wrap a loaded annotator session.
    #[must_use]
    pub const fn new(session: SharedSession) -> Self {
        Self { session }
    }
}

impl EdgeDetector for LineartDetector {
    fn detect(&self, image: &RgbaImage) -> Result<DynamicImage> {
        let rgb = flatten_on_white(image);
        let tensor = image_to_tensor(&rgb, TensorRange::Unit);
        let model = self.session.name();

        let mut session = self.session.lock()?;
        let input_name = session::input_names(&session)
            .into_iter()
            .next()
            .unwrap_or_else(|| "input".to_string());
        let input = session::float_input(model, tensor)?;

        let output = session::run_locked(model, &mut session, vec![(input_name, input)])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "line map output".to_string(),
                actual: "no output".to_string(),
            })?;
        drop(session);

        let lines = inverted_line_map(&session::into_array4(output)?);

        let lines = if lines.dimensions() == image.dimensions() {
            lines
        } else {
            imageops::resize(
                &lines,
                image.width(),
                image.height(),
                imageops::FilterType::Triangle,
            )
        };

        Ok(DynamicImage::ImageLuma8(lines))
    }
}

/// Turn the annotator's ink map (dark lines on white) into white lines on
/// black.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn inverted_line_map(output: &Array4<f32>) -> GrayImage {
    let (_, _, height, width) = output.dim();

    // Safe: annotator outputs match the input image, whose sides fit in u32
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let ink = (output[[0, 0, y as usize, x as usize]] * 255.0).clamp(0.0, 255.0) as u8;
        Luma([255 - ink])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_paper_has_no_lines() {
        let output = Array4::<f32>::ones((1, 1, 4, 4));
        let lines = inverted_line_map(&output);

        assert!(lines.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_ink_becomes_white_line() {
        let mut output = Array4::<f32>::ones((1, 1, 3, 5));
        output[[0, 0, 1, 2]] = 0.0;
        let lines = inverted_line_map(&output);

        assert_eq!(lines.dimensions(), (5, 3));
        assert_eq!(lines.get_pixel(2, 1)[0], 255);
        assert_eq!(lines.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let mut output = Array4::<f32>::zeros((1, 1, 1, 2));
        output[[0, 0, 0, 0]] = -0.5;
        output[[0, 0, 0, 1]] = 1.7;
        let lines = inverted_line_map(&output);

        assert_eq!(lines.get_pixel(0, 0)[0], 255);
        assert_eq!(lines.get_pixel(1, 0)[0], 0);
    }
}
