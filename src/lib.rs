//! # `SketchColor`
//!
//! A library for coloring lineart sketches with `ControlNet`-guided Stable Diffusion.
//!
//! A grayscale sketch is thresholded into a transparent overlay and drawn over the
//! user's brush strokes. The lines of that composite are re-detected and handed to a
//! lineart `ControlNet`, which steers Stable Diffusion 1.5 towards a colored
//! illustration that keeps the original composition.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use sketchcolor::pipeline::SaveOptions;
//! use sketchcolor::{Config, Pipeline};
//!
//! # fn main() -> sketchcolor::Result<()> {
//! let config = Config::default();
//! let pipeline = Pipeline::new(config)?;
//!
//! pipeline.process(
//!     Path::new("sketch.png"),
//!     Some(Path::new("strokes.png")),
//!     Path::new("colored.png"),
//!     &SaveOptions::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use error::{Error, Result};
pub use pipeline::{Config, ModelBundle, Orchestrator, Pipeline};
