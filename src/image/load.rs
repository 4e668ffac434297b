//! Image loading utilities.

use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage, Luma};

use crate::error::{Error, Result};

use super::{BrushCanvas, LineartImage};

/// Resampling filter used for uploads and the generation input.
pub(crate) const UPLOAD_FILTER: FilterType = FilterType::CatmullRom;

/// Load an uploaded lineart file as a grayscale buffer of `size`.
///
/// Returns `Ok(None)` when no file was provided; that is not an error.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the file cannot be read or parsed as an image.
pub fn load_lineart(path: Option<&Path>, size: (u32, u32)) -> Result<Option<LineartImage>> {
    let Some(path) = path else {
        return Ok(None);
    };

    let gray = to_luma_601(&decode(path)?);
    let (width, height) = size;

    if gray.dimensions() == size {
        return Ok(Some(gray));
    }

    Ok(Some(imageops::resize(&gray, width, height, UPLOAD_FILTER)))
}

/// 8-bit luma with ITU-R 601 weights in 16-bit fixed point.
///
/// `image`'s own conversion uses Rec. 709 weights, which moves colored ink
/// across the white threshold.
#[allow(clippy::cast_possible_truncation)]
fn to_luma_601(img: &DynamicImage) -> LineartImage {
    let rgb = img.to_rgb8();

    LineartImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = (u32::from(r) * 19_595 + u32::from(g) * 38_470 + u32::from(b) * 7_471 + 0x8000)
            >> 16;
        // Safe: the weights sum to 65536, so luma <= 255
        Luma([luma as u8])
    })
}

/// Load a painted strokes file as a brush canvas of `size`.
///
/// Files of another size are resampled so they line up with the lineart.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the file cannot be read or parsed as an image.
pub fn load_brush_canvas(path: &Path, size: (u32, u32)) -> Result<BrushCanvas> {
    let img = decode(path)?;
    let (width, height) = size;

    let rgba = if (img.width(), img.height()) == size {
        img.to_rgba8()
    } else {
        tracing::debug!(
            "Resampling brush canvas from {}x{} to {width}x{height}",
            img.width(),
            img.height()
        );
        img.resize_exact(width, height, UPLOAD_FILTER).to_rgba8()
    };

    Ok(BrushCanvas::new(rgba))
}

fn decode(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| Error::Decode {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn test_absent_file_is_not_an_error() {
        let loaded = load_lineart(None, (512, 512)).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_lineart_is_resized_grayscale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sketch.png");
        GrayImage::from_pixel(100, 60, Luma([255])).save(&path).unwrap();

        let lineart = load_lineart(Some(&path), (512, 512)).unwrap().unwrap();

        assert_eq!(lineart.dimensions(), (512, 512));
        assert!(lineart.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_colored_ink_uses_601_luma() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyan.png");
        RgbImage::from_pixel(8, 8, Rgb([200, 255, 255])).save(&path).unwrap();

        let lineart = load_lineart(Some(&path), (8, 8)).unwrap().unwrap();

        // Just under the white threshold, so it stays ink
        assert_eq!(lineart.get_pixel(3, 3)[0], 239);
    }

    #[test]
    fn test_primary_colors_luma() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        }));

        let gray = to_luma_601(&img);

        assert_eq!(gray.get_pixel(0, 0)[0], 76);
        assert_eq!(gray.get_pixel(1, 0)[0], 150);
        assert_eq!(gray.get_pixel(2, 0)[0], 29);
    }

    #[test]
    fn test_undecodable_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_image.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        let err = load_lineart(Some(&path), (512, 512)).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.png");

        let err = load_lineart(Some(&path), (512, 512)).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_brush_canvas_resampled_to_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strokes.png");
        RgbaImage::from_pixel(64, 64, Rgba([255, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let canvas = load_brush_canvas(&path, (512, 512)).unwrap();

        assert_eq!(canvas.composite().dimensions(), (512, 512));
        assert_eq!(*canvas.composite().get_pixel(200, 200), Rgba([255, 0, 0, 255]));
    }
}
