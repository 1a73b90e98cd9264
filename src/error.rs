use std::{error::Error, fmt, io, path::PathBuf};

use rayon::ThreadPoolBuildError;

/// The crate's result type.
pub type Result<T> = std::result::Result<T, HordeError>;

/// Every failure the horde can surface.
///
/// Configuration errors (`NoPlatform`, `NoDevice`, `AllocationTooLarge`,
/// `InsufficientMemory`, `KernelSource`, `MissingEntryPoint`) abort construction,
/// there is no degraded mode.
#[derive(Debug)]
pub enum HordeError {
    /// No compute platform was found at all.
    NoPlatform,
    /// Platforms exist but none exposes a usable device.
    NoDevice,
    /// A single device buffer would exceed the device's maximum allocation size.
    AllocationTooLarge {
        device: String,
        required: u64,
        available: u64,
    },
    /// The whole population doesn't fit in the aggregate device memory.
    InsufficientMemory { required: u64, available: u64 },
    /// The kernel source resource couldn't be read.
    KernelSource { path: PathBuf, source: io::Error },
    /// The kernel source doesn't export a required entry point.
    MissingEntryPoint { entry: &'static str },
    /// A device operation was requested before the worker was initialized.
    Uninitialized,
    /// A feature vector doesn't match the configured dimension.
    FeatureDimension { expected: usize, got: usize },
    /// A per-device request targeted a device that doesn't exist.
    DeviceIndex { index: usize, devices: usize },
    /// The compute API reported a failure.
    Compute { device: String, detail: String },
    /// The debug NaN scan found a corrupted array.
    NanDetected { device: String, array: &'static str },
    /// The worker pool couldn't be started.
    WorkerPool(ThreadPoolBuildError),
    /// The worker pool was already shut down.
    ShutDown,
}

impl HordeError {
    /// Wraps a compute API failure for the given device.
    ///
    /// # Arguments
    /// * `device` - The name of the failing device.
    /// * `detail` - Anything displayable describing the failure.
    pub fn compute(device: &str, detail: impl fmt::Display) -> Self {
        Self::Compute {
            device: device.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for HordeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPlatform => {
                f.write_str("no compute platform detected, the drivers may be missing")
            }
            Self::NoDevice => f.write_str("no available compute device found"),
            Self::AllocationTooLarge {
                device,
                required,
                available,
            } => write!(
                f,
                "allocation too large on {device}: required {required} bytes, max allocation {available} bytes (too many demons or features)"
            ),
            Self::InsufficientMemory {
                required,
                available,
            } => write!(
                f,
                "not enough device memory: required {required} bytes, available {available} bytes (too many demons or features)"
            ),
            Self::KernelSource { path, source } => {
                write!(f, "failed to read kernel source {}: {source}", path.display())
            }
            Self::MissingEntryPoint { entry } => {
                write!(f, "kernel source doesn't export entry point `{entry}`")
            }
            Self::Uninitialized => {
                f.write_str("device worker must be initialized before this operation")
            }
            Self::FeatureDimension { expected, got } => {
                write!(f, "feature vector length mismatch: got {got}, expected {expected}")
            }
            Self::DeviceIndex { index, devices } => {
                write!(f, "device index {index} out of range for {devices} device(s)")
            }
            Self::Compute { device, detail } => write!(f, "compute error on {device}: {detail}"),
            Self::NanDetected { device, array } => write!(f, "{array} has NaN on {device}"),
            Self::WorkerPool(e) => write!(f, "failed to start the worker pool: {e}"),
            Self::ShutDown => f.write_str("the worker pool has been shut down"),
        }
    }
}

impl From<ThreadPoolBuildError> for HordeError {
    fn from(value: ThreadPoolBuildError) -> Self {
        Self::WorkerPool(value)
    }
}

impl Error for HordeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::KernelSource { source, .. } => Some(source),
            Self::WorkerPool(e) => Some(e),
            _ => None,
        }
    }
}
