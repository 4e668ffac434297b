//! Classic edge detection as an offline stand-in for the neural annotator.

use image::{DynamicImage, RgbaImage};
use imageproc::edges::canny;

use crate::error::Result;

use super::{flatten_on_white, EdgeDetector};

/// Canny edge detector.
///
/// Needs no checkpoint, so it works without downloads. Produces white edges
/// on black like the lineart annotator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CannyDetector {
    /// Low threshold for Canny edge detection.
    pub low_threshold: f32,
    /// High threshold for Canny edge detection.
    pub high_threshold: f32,
}

impl Default for CannyDetector {
    fn default() -> Self {
        Self {
            low_threshold: 100.0,
            high_threshold: 200.0,
        }
    }
}

impl EdgeDetector for CannyDetector {
    fn detect(&self, image: &RgbaImage) -> Result<DynamicImage> {
        let gray = DynamicImage::ImageRgb8(flatten_on_white(image)).to_luma8();
        let edges = canny(&gray, self.low_threshold, self.high_threshold);

        Ok(DynamicImage::ImageLuma8(edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_blank_image_has_no_edges() {
        let blank = RgbaImage::from_pixel(64, 64, Rgba([255, 255, 255, 255]));
        let edges = CannyDetector::default().detect(&blank).unwrap().to_luma8();

        assert!(edges.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_transparent_image_has_no_edges() {
        let transparent = RgbaImage::new(64, 64);
        let edges = CannyDetector::default()
            .detect(&transparent)
            .unwrap()
            .to_luma8();

        assert!(edges.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_black_square_has_white_outline() {
        let img = RgbaImage::from_fn(64, 64, |x, y| {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let edges = CannyDetector::default().detect(&img).unwrap().to_luma8();

        assert_eq!(edges.dimensions(), (64, 64));
        assert!(edges.pixels().any(|p| p[0] == 255));
        // Far from the square nothing fires
        assert_eq!(edges.get_pixel(2, 2)[0], 0);
        assert_eq!(edges.get_pixel(32, 32)[0], 0);
    }
}
