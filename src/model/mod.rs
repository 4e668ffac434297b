//! Model selection, caching, and ONNX session plumbing.

mod device;
mod loader;
pub mod session;

pub use device::{Device, Precision};
pub use loader::{ModelCache, ModelSource, ModelType, DEFAULT_SD_REPO, TOKENIZER_URL};
pub use session::SharedSession;
