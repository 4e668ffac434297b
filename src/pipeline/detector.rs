//! Runtime choice of edge detector.

use std::fmt;
use std::str::FromStr;

use image::{DynamicImage, RgbaImage};

use crate::error::Result;

use super::{CannyDetector, EdgeDetector, LineartDetector};

/// Which edge detector to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DetectorKind {
    /// Neural lineart annotator (matches the lineart `ControlNet`).
    #[default]
    Lineart,
    /// Classic Canny edges, no checkpoint required.
    Canny,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lineart => write!(f, "lineart"),
            Self::Canny => write!(f, "canny"),
        }
    }
}

impl FromStr for DetectorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lineart" => Ok(Self::Lineart),
            "canny" => Ok(Self::Canny),
            _ => Err(format!("unknown detector '{s}', expected lineart or canny")),
        }
    }
}

/// The loaded edge detector.
pub enum Detector {
    Lineart(LineartDetector),
    Canny(CannyDetector),
}

impl Detector {
    /// Which kind of detector this is.
    #[must_use]
    pub const fn kind(&self) -> DetectorKind {
        match self {
            Self::Lineart(_) => DetectorKind::Lineart,
            Self::Canny(_) => DetectorKind::Canny,
        }
    }
}

impl EdgeDetector for Detector {
    fn detect(&self, image: &RgbaImage) -> Result<DynamicImage> {
        match self {
            Self::Lineart(detector) => detector.detect(image),
            Self::Canny(detector) => detector.detect(image),
        }
    }
}
