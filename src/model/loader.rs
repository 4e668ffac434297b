//! Model downloading and loading utilities.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use ort::session::Session;

use crate::error::{Error, Result};

use super::device::{Device, Precision};

/// Hugging Face repository hosting the Stable Diffusion 1.5 ONNX exports.
///
/// Only the text encoder and VAE decoder are taken from here. Its `UNet` has
/// no residual inputs and cannot be driven by a `ControlNet`.
pub const DEFAULT_SD_REPO: &str = "https://huggingface.co/modularai/stable-diffusion-1.5-onnx/resolve/main";

/// CLIP tokenizer shared by the Stable Diffusion 1.5 text encoder.
pub const TOKENIZER_URL: &str =
    "https://huggingface.co/openai/clip-vit-large-patch14/resolve/main/tokenizer.json";

/// Types of models used in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Lineart annotator - extracts clean lines from a sketch.
    LineartDetector,
    /// CLIP text encoder - embeds the prompts.
    TextEncoder,
    /// `ControlNet` - turns the edge map into `UNet` residuals.
    ControlNet,
    /// `UNet` - predicts noise at each denoising step, taking `ControlNet`
    /// residuals as extra inputs.
    Unet,
    /// VAE Decoder - decodes latents to images.
    VaeDecoder,
}

/// Where a model's files are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    StableDiffusion,
    Control,
}

impl ModelType {
    /// All models the pipeline loads, in load order.
    pub const ALL: [Self; 5] = [
        Self::LineartDetector,
        Self::TextEncoder,
        Self::ControlNet,
        Self::Unet,
        Self::VaeDecoder,
    ];

    /// Directory name of this model inside a repository or cache.
    #[must_use]
    pub const fn dir_name(&self) -> &'static str {
        match self {
            Self::LineartDetector => "lineart",
            Self::TextEncoder => "text_encoder",
            Self::ControlNet => "controlnet",
            Self::Unet => "unet",
            Self::VaeDecoder => "vae_decoder",
        }
    }

    /// File name of the ONNX graph.
    #[must_use]
    pub const fn filename(&self) -> &'static str {
        "model.onnx"
    }

    /// Get the external data filename for models with external data.
    /// Note: Must match the reference in the ONNX file (usually `model.onnx_data`).
    #[must_use]
    pub const fn data_filename(&self) -> Option<&'static str> {
        match self {
            // ONNX file references this exact name internally
            Self::Unet => Some("model.onnx_data"),
            _ => None,
        }
    }

    /// Get the approximate size in bytes for progress indication.
    #[must_use]
    pub const fn approx_size(&self) -> u64 {
        match self {
            Self::LineartDetector => 17_000_000,  // ~17 MB
            Self::TextEncoder => 490_000_000,     // ~490 MB
            Self::ControlNet => 1_450_000_000,    // ~1.45 GB
            Self::Unet => 1_300_000,              // ~1.3 MB (main file, data file is separate)
            Self::VaeDecoder => 100_000_000,      // ~100 MB
        }
    }

    /// Get the approximate size of the data file in bytes.
    #[must_use]
    pub const fn data_approx_size(&self) -> u64 {
        match self {
            Self::Unet => 3_500_000_000, // ~3.5 GB
            _ => 0,
        }
    }

    const fn origin(&self) -> Origin {
        match self {
            Self::LineartDetector | Self::ControlNet | Self::Unet => Origin::Control,
            Self::TextEncoder | Self::VaeDecoder => Origin::StableDiffusion,
        }
    }
}

/// Base URLs the checkpoints are downloaded from.
///
/// Both repositories are laid out as `<base>/<model>/model.onnx` and hold
/// full-precision exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    /// Base URL of the Stable Diffusion text encoder and VAE exports.
    pub sd_repo: String,
    /// Base URL of the lineart annotator, `ControlNet` and a `UNet` export
    /// with residual inputs. There is no published default, so without it
    /// those checkpoints must already be cached or come from a model
    /// directory.
    pub control_repo: Option<String>,
    /// URL of the CLIP `tokenizer.json`.
    pub tokenizer_url: String,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            sd_repo: DEFAULT_SD_REPO.to_string(),
            control_repo: None,
            tokenizer_url: TOKENIZER_URL.to_string(),
        }
    }
}

impl ModelSource {
    /// URL of `file` belonging to `model_type`, if a repository hosts it.
    #[must_use]
    pub fn url(&self, model_type: ModelType, file: &str) -> Option<String> {
        let base = match model_type.origin() {
            Origin::StableDiffusion => Some(&self.sd_repo),
            Origin::Control => self.control_repo.as_ref(),
        }?;

        Some(format!(
            "{}/{}/{file}",
            base.trim_end_matches('/'),
            model_type.dir_name()
        ))
    }
}

/// Manages the model cache directory and downloads.
pub struct ModelCache {
    cache_dir: PathBuf,
    source: ModelSource,
    offline: bool,
}

impl ModelCache {
    /// Create a new model cache.
    ///
    /// Uses the platform-appropriate cache directory:
    /// - Windows: `%LOCALAPPDATA%\sketchcolor\models`
    /// - Linux: `~/.cache/sketchcolor/models`
    /// - macOS: `~/Library/Caches/sketchcolor/models`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(source: ModelSource) -> Result<Self> {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = base.join("sketchcolor").join("models");

        fs::create_dir_all(&cache_dir).map_err(|source| Error::CacheDir {
            path: cache_dir.clone(),
            source,
        })?;

        Ok(Self {
            cache_dir,
            source,
            offline: false,
        })
    }

    /// Use a local directory of checkpoints and never download.
    ///
    /// The directory mirrors the cache layout:
    /// `<dir>/<fp32|fp16>/<model>/model.onnx` and `<dir>/tokenizer.json`.
    #[must_use]
    pub fn local<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            cache_dir: dir.into(),
            source: ModelSource::default(),
            offline: true,
        }
    }

    /// Root directory of this cache.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding the files of `model_type` at `precision`.
    #[must_use]
    pub fn model_dir(&self, model_type: ModelType, precision: Precision) -> PathBuf {
        self.cache_dir
            .join(precision.variant_dir())
            .join(model_type.dir_name())
    }

    /// Get the path to a model file, downloading if necessary.
    ///
    /// A model directory is searched at `precision`. Downloads are published
    /// at full precision only and cached under that variant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelMissing`] if the model is not present and cannot
    /// be downloaded, or a download error.
    pub fn get_model_path(&self, model_type: ModelType, precision: Precision) -> Result<PathBuf> {
        let precision = if self.offline {
            precision
        } else {
            Precision::Full
        };
        let dir = self.model_dir(model_type, precision);
        let path = dir.join(model_type.filename());

        if !path.exists() {
            self.fetch(
                self.source.url(model_type, model_type.filename()),
                &path,
                model_type,
                model_type.approx_size(),
            )?;
        }

        // Download external data file if needed
        if let Some(data_filename) = model_type.data_filename() {
            let data_path = dir.join(data_filename);
            if self.offline {
                // Local exports may embed their weights
                if !data_path.exists() {
                    tracing::debug!("No external data at {}", data_path.display());
                }
            } else if !data_path.exists() {
                self.fetch(
                    self.source.url(model_type, data_filename),
                    &data_path,
                    model_type,
                    model_type.data_approx_size(),
                )?;
            }
        }

        Ok(path)
    }

    /// Get the path to the CLIP tokenizer, downloading if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer cannot be downloaded or accessed.
    pub fn get_tokenizer_path(&self) -> Result<PathBuf> {
        let path = self.cache_dir.join("tokenizer.json");

        if !path.exists() {
            if self.offline {
                return Err(Error::ModelMissing {
                    name: "tokenizer.json".to_string(),
                    path,
                });
            }
            download_file(&self.source.tokenizer_url, &path, "tokenizer.json", 2_200_000)?;
        }

        Ok(path)
    }

    /// Load an ONNX model session bound to `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded.
    pub fn load_session(&self, model_type: ModelType, device: Device) -> Result<Session> {
        let path = self.get_model_path(model_type, device.precision())?;
        let name = format!("{}/{}", model_type.dir_name(), model_type.filename());

        tracing::debug!("Loading {name} from {} on {device}", path.display());

        Session::builder()
            .and_then(|builder| builder.with_execution_providers(device.execution_providers()))
            .and_then(|builder| builder.commit_from_file(&path))
            .map_err(|source| Error::ModelLoad { name, source })
    }

    fn fetch(
        &self,
        url: Option<String>,
        path: &Path,
        model_type: ModelType,
        approx_size: u64,
    ) -> Result<()> {
        let name = format!("{}/{}", model_type.dir_name(), file_name(path));
        let missing = || Error::ModelMissing {
            name: name.clone(),
            path: path.to_path_buf(),
        };

        if self.offline {
            return Err(missing());
        }
        let Some(url) = url else {
            tracing::warn!("No download source for {name}; use a model directory or a control repository");
            return Err(missing());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::CacheDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        download_file(&url, path, &name, approx_size)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().into_owned())
}

/// Download a file from a URL to a path with progress indication.
fn download_file(url: &str, path: &Path, name: &str, approx_size: u64) -> Result<()> {
    tracing::info!("Downloading {name} from {url}");

    let client = reqwest::blocking::Client::new();
    let response = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|source| Error::ModelDownload {
            name: name.to_string(),
            source,
        })?;

    let total_size = response.content_length().unwrap_or(approx_size);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Downloading {name}"));

    // Write to a temporary file first, then rename for atomicity
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;

    let mut downloaded = 0u64;
    let mut reader = response;

    loop {
        let mut buffer = [0u8; 8192];
        let bytes_read = std::io::Read::read(&mut reader, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;
        pb.set_position(downloaded);
    }

    pb.finish_with_message(format!("Downloaded {name}"));

    fs::rename(&temp_path, path)?;

    Ok(())
}
