//! Lineart overlay construction and alpha compositing.
//!
//! Lineart is turned into a hard binary overlay: paper becomes a hole, ink
//! becomes opaque black. The overlay is then drawn *over* the user's brush
//! canvas so painted colour shows through the holes while every line stays
//! black on top.

use std::path::Path;

use image::{imageops, Luma, Rgba, RgbaImage};

use crate::error::{Error, Result};

use super::{load_lineart, CompositeImage, LineartImage, WHITE_THRESHOLD};

const TRANSPARENT_WHITE: Rgba<u8> = Rgba([255, 255, 255, 0]);
const OPAQUE_BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// The user's painted layer from the drawing surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrushCanvas {
    composite: RgbaImage,
}

impl BrushCanvas {
    /// Wrap the flattened RGBA layer of a drawing surface.
    #[must_use]
    pub const fn new(composite: RgbaImage) -> Self {
        Self { composite }
    }

    /// A fully transparent canvas with nothing painted on it.
    #[must_use]
    pub fn blank(size: (u32, u32)) -> Self {
        Self::new(RgbaImage::new(size.0, size.1))
    }

    /// A canvas seeded with the uploaded lineart, as the sketchpad shows it
    /// right after an upload.
    #[must_use]
    pub fn from_lineart(lineart: &LineartImage) -> Self {
        let mut composite = RgbaImage::new(lineart.width(), lineart.height());
        for (dst, &Luma([v])) in composite.pixels_mut().zip(lineart.pixels()) {
            *dst = Rgba([v, v, v, 255]);
        }
        Self::new(composite)
    }

    /// The flattened pixel layer.
    #[must_use]
    pub const fn composite(&self) -> &RgbaImage {
        &self.composite
    }

    /// Consume the canvas and return its pixel layer.
    #[must_use]
    pub fn into_composite(self) -> RgbaImage {
        self.composite
    }
}

/// Map one lineart luma value to its overlay pixel.
///
/// Near-white (`> 240`) becomes transparent white, everything else opaque
/// black. There is no third outcome.
#[inline]
#[must_use]
pub const fn threshold_pixel(value: u8) -> Rgba<u8> {
    if value > WHITE_THRESHOLD {
        TRANSPARENT_WHITE
    } else {
        OPAQUE_BLACK
    }
}

/// Build the binary RGBA overlay for a lineart buffer.
#[must_use]
pub fn overlay_mask(lineart: &LineartImage) -> RgbaImage {
    let mut overlay = RgbaImage::new(lineart.width(), lineart.height());
    for (dst, &Luma([v])) in overlay.pixels_mut().zip(lineart.pixels()) {
        *dst = threshold_pixel(v);
    }
    overlay
}

/// Composite the lineart at `path` over `canvas`.
///
/// Returns `Ok(None)` unless both the canvas and the file are present. The
/// file is decoded again on every call so the overlay always reflects the
/// file as it is now, not as it was when first uploaded.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the lineart cannot be decoded, and
/// [`Error::DimensionMismatch`] if the canvas is not `size`.
pub fn merge_overlay(
    canvas: Option<&BrushCanvas>,
    path: Option<&Path>,
    size: (u32, u32),
) -> Result<Option<CompositeImage>> {
    let (Some(canvas), Some(path)) = (canvas, path) else {
        return Ok(None);
    };

    let Some(lineart) = load_lineart(Some(path), size)? else {
        return Ok(None);
    };
    let overlay = overlay_mask(&lineart);

    let background = canvas.composite();
    if background.dimensions() != size {
        return Err(Error::DimensionMismatch {
            expected_width: size.0,
            expected_height: size.1,
            width: background.width(),
            height: background.height(),
        });
    }

    let mut composite = background.clone();
    imageops::overlay(&mut composite, &overlay, 0, 0);

    tracing::debug!(
        "Composited {}x{} lineart overlay over brush canvas",
        size.0,
        size.1
    );

    Ok(Some(composite))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use tempfile::TempDir;

    const SIZE: (u32, u32) = (512, 512);

    fn write_lineart(dir: &TempDir, img: &GrayImage) -> std::path::PathBuf {
        let path = dir.path().join("lineart.png");
        img.save(&path).unwrap();
        path
    }

    /// White paper with a black square outline from 100..=400.
    fn outlined_square() -> GrayImage {
        GrayImage::from_fn(SIZE.0, SIZE.1, |x, y| {
            let on_edge = (x == 100 || x == 400) && (100..=400).contains(&y)
                || (y == 100 || y == 400) && (100..=400).contains(&x);
            if on_edge {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    #[test]
    fn test_threshold_is_binary() {
        for v in 0..=u8::MAX {
            let px = threshold_pixel(v);
            if v > 240 {
                assert_eq!(px, Rgba([255, 255, 255, 0]), "value {v}");
            } else {
                assert_eq!(px, Rgba([0, 0, 0, 255]), "value {v}");
            }
        }
    }

    #[test]
    fn test_overlay_never_has_partial_alpha() {
        let gradient = GrayImage::from_fn(256, 4, |x, _| Luma([x as u8]));
        let overlay = overlay_mask(&gradient);

        assert!(overlay.pixels().all(|p| p[3] == 0 || p[3] == 255));
        assert_eq!(overlay.get_pixel(240, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(overlay.get_pixel(241, 0), &Rgba([255, 255, 255, 0]));
    }

    #[test]
    fn test_absent_inputs_give_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lineart(&dir, &outlined_square());
        let canvas = BrushCanvas::blank(SIZE);

        assert!(merge_overlay(None, None, SIZE).unwrap().is_none());
        assert!(merge_overlay(Some(&canvas), None, SIZE).unwrap().is_none());
        assert!(merge_overlay(None, Some(&path), SIZE).unwrap().is_none());
        assert!(merge_overlay(Some(&canvas), Some(&path), SIZE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_absent_canvas_skips_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.png");
        std::fs::write(&path, b"garbage").unwrap();

        assert!(merge_overlay(None, Some(&path), SIZE).unwrap().is_none());
    }

    #[test]
    fn test_strokes_show_through_and_lines_stay_black() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lineart(&dir, &outlined_square());

        let mut strokes = RgbaImage::new(SIZE.0, SIZE.1);
        for y in 200..300 {
            for x in 90..300 {
                strokes.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }
        let canvas = BrushCanvas::new(strokes);

        let composite = merge_overlay(Some(&canvas), Some(&path), SIZE)
            .unwrap()
            .unwrap();

        // Interior stroke survives.
        assert_eq!(composite.get_pixel(250, 250), &Rgba([255, 0, 0, 255]));
        // Stroke painted across the outline is covered by it.
        assert_eq!(composite.get_pixel(100, 250), &Rgba([0, 0, 0, 255]));
        // Unpainted paper stays the canvas pixel.
        assert_eq!(composite.get_pixel(10, 10), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_reapplying_overlay_keeps_black_regions() {
        let dir = tempfile::tempdir().unwrap();
        let lineart = outlined_square();
        let path = write_lineart(&dir, &lineart);
        let overlay = overlay_mask(&lineart);

        let canvas = BrushCanvas::from_lineart(&lineart);
        let first = merge_overlay(Some(&canvas), Some(&path), SIZE)
            .unwrap()
            .unwrap();
        let second = merge_overlay(Some(&BrushCanvas::new(first.clone())), Some(&path), SIZE)
            .unwrap()
            .unwrap();

        for (x, y, px) in overlay.enumerate_pixels() {
            if px[3] == 255 {
                assert_eq!(first.get_pixel(x, y), second.get_pixel(x, y));
                assert_eq!(second.get_pixel(x, y), &Rgba([0, 0, 0, 255]));
            }
        }
        assert_eq!(first, second);
    }

    #[test]
    fn test_lineart_is_reread_on_every_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lineart(&dir, &GrayImage::from_pixel(SIZE.0, SIZE.1, Luma([255])));
        let canvas = BrushCanvas::blank(SIZE);

        let before = merge_overlay(Some(&canvas), Some(&path), SIZE)
            .unwrap()
            .unwrap();
        assert!(before.pixels().all(|p| p[3] == 0));

        GrayImage::from_pixel(SIZE.0, SIZE.1, Luma([0]))
            .save(&path)
            .unwrap();
        let after = merge_overlay(Some(&canvas), Some(&path), SIZE)
            .unwrap()
            .unwrap();
        assert!(after.pixels().all(|p| *p == Rgba([0, 0, 0, 255])));
    }

    #[test]
    fn test_canvas_of_wrong_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lineart(&dir, &outlined_square());
        let canvas = BrushCanvas::blank((256, 256));

        let err = merge_overlay(Some(&canvas), Some(&path), SIZE).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                width: 256,
                height: 256,
                ..
            }
        ));
    }

    #[test]
    fn test_canvas_from_lineart_is_opaque_gray() {
        let lineart = GrayImage::from_pixel(4, 4, Luma([128]));
        let canvas = BrushCanvas::from_lineart(&lineart);

        assert!(canvas
            .composite()
            .pixels()
            .all(|p| *p == Rgba([128, 128, 128, 255])));
    }
}
