use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The default location of the kernel source, relative to the working directory.
pub const DEFAULT_KERNEL_PATH: &str = "kernels/horde.cl";

/// The learning hyperparameters baked into the compiled kernels.
///
/// Changing them forces a kernel recompilation on every affected device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    /// Primary step size.
    pub alpha: f32,
    /// Secondary step size ratio for the `w` weights.
    pub eta: f32,
    /// Eligibility trace decay.
    pub lambda: f32,
}

impl Hyperparams {
    /// Creates a new `Hyperparams`.
    ///
    /// # Arguments
    /// * `alpha` - Primary step size.
    /// * `eta` - Secondary step size ratio.
    /// * `lambda` - Eligibility trace decay.
    pub fn new(alpha: f32, eta: f32, lambda: f32) -> Self {
        Self { alpha, eta, lambda }
    }
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            eta: 0.01,
            lambda: 0.9,
        }
    }
}

/// Immutable settings shared by every device worker of a horde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HordeConfig {
    /// Where the kernel source text lives.
    pub kernel_path: PathBuf,
    /// Requested work-group size, clamped to each device's maximum.
    pub work_group_size: usize,
    /// Whether to use the device's preferred float vector width.
    pub vectorize: bool,
    /// The hyperparameters of the first compilation.
    pub hyperparams: Hyperparams,
}

impl Default for HordeConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from(DEFAULT_KERNEL_PATH),
            work_group_size: 64,
            vectorize: true,
            hyperparams: Hyperparams::default(),
        }
    }
}
