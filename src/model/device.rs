//! Compute device and numeric precision selection.

use std::fmt;
use std::str::FromStr;

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
};

/// Compute backend the models run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// General-purpose CPU execution.
    Cpu,
    /// CUDA accelerator with the given device ordinal.
    Cuda(i32),
}

/// Numeric precision of the loaded checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// float32 weights.
    Full,
    /// float16 weights with float32 inputs and outputs.
    Half,
}

impl Device {
    /// Pick CUDA if its execution provider is usable, else CPU.
    #[must_use]
    pub fn auto() -> Self {
        match CUDAExecutionProvider::default().is_available() {
            Ok(true) => Self::Cuda(0),
            Ok(false) => Self::Cpu,
            Err(err) => {
                tracing::debug!("CUDA availability check failed: {err}");
                Self::Cpu
            }
        }
    }

    /// Use `requested` when given, otherwise auto-detect.
    #[must_use]
    pub fn select(requested: Option<Self>) -> Self {
        requested.unwrap_or_else(Self::auto)
    }

    /// Whether this device is an accelerator.
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    /// Reduced precision on accelerators, full precision otherwise.
    #[must_use]
    pub const fn precision(self) -> Precision {
        if self.is_accelerator() {
            Precision::Half
        } else {
            Precision::Full
        }
    }

    /// Execution providers that bind a session to this device.
    pub(crate) fn execution_providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Self::Cpu => vec![CPUExecutionProvider::default().build()],
            // Registration failure must abort loading, not silently fall back
            Self::Cuda(id) => vec![CUDAExecutionProvider::default()
                .with_device_id(id)
                .build()
                .error_on_failure()],
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse::<i32>().ok())
                .filter(|id| *id >= 0)
                .map(Self::Cuda)
                .ok_or_else(|| format!("unknown device '{s}', expected cpu, cuda, or cuda:N")),
        }
    }
}

impl Precision {
    /// Subdirectory holding checkpoints of this precision.
    #[must_use]
    pub const fn variant_dir(self) -> &'static str {
        match self {
            Self::Full => "fp32",
            Self::Half => "fp16",
        }
    }
}
