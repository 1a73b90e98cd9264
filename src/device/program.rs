use std::{fs, path::Path};

use log::debug;

use super::buffers::DeviceBuffers;
use crate::{
    compute::{
        Backend, Define,
        KernelArg::{Buffer, Int},
        exported_entries,
    },
    config::Hyperparams,
    error::{HordeError, Result},
};

pub const INITIALISE: &str = "initialise";
pub const UPDATE: &str = "updateGTDLambda";
pub const VEC_UPDATE: &str = "vec_updateGTDLambda";
pub const PREDICT: &str = "predict";
pub const VEC_PREDICT: &str = "vec_predict";
pub const TRACE_RESET: &str = "traceReset";

const REQUIRED_ENTRIES: [&str; 6] = [
    INITIALISE,
    UPDATE,
    VEC_UPDATE,
    PREDICT,
    VEC_PREDICT,
    TRACE_RESET,
];

/// The kernel source text, checked to export every entry point the workers launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    text: String,
}

impl KernelSource {
    /// Reads the kernel source resource.
    ///
    /// # Arguments
    /// * `path` - Where the source lives.
    ///
    /// # Returns
    /// The source, or a fatal error if it's unreadable or incomplete.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| HordeError::KernelSource {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_text(text)
    }

    /// Checks an in-memory kernel source.
    ///
    /// # Returns
    /// The source, or `MissingEntryPoint` naming the first absent entry.
    pub fn from_text(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let exported = exported_entries(&text);

        if let Some(entry) = REQUIRED_ENTRIES
            .into_iter()
            .find(|entry| !exported.iter().any(|e| e == entry))
        {
            return Err(HordeError::MissingEntryPoint { entry });
        }

        Ok(Self { text })
    }

    /// The source text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// The kernels of one compilation, bound to a device's buffers.
///
/// Never mutated: a hyperparameter change builds a new one that replaces it whole.
pub struct CompiledProgram<B: Backend> {
    pub initialise: B::Kernel,
    pub update: B::Kernel,
    pub predict: B::Kernel,
    pub trace_reset: B::Kernel,
    pub hyperparams: Hyperparams,
    pub vector_width: usize,
}

impl<B: Backend> CompiledProgram<B> {
    /// Compiles the source with the hyperparameters baked in and binds every kernel.
    ///
    /// # Arguments
    /// * `device` - The device to compile for.
    /// * `source` - The kernel source.
    /// * `buffers` - The device's buffer set.
    /// * `feature_dim` - The feature dimension passed to every kernel.
    /// * `hyperparams` - The learning constants.
    /// * `vector_width` - Demons per work-item, `1` selects the scalar entry points.
    pub fn build(
        device: &B,
        source: &KernelSource,
        buffers: &DeviceBuffers<B::Buffer>,
        feature_dim: usize,
        hyperparams: Hyperparams,
        vector_width: usize,
    ) -> Result<Self> {
        let mut defines = vec![
            Define::float("ALPHA", hyperparams.alpha),
            Define::float("ETA", hyperparams.eta),
            Define::float("LAMBDA", hyperparams.lambda),
        ];
        if vector_width > 1 {
            defines.push(Define::new("VECTOR", vector_width.to_string()));
        }

        debug!(
            device = device.info().name.as_str(), vector_width = vector_width;
            "compiling kernels with alpha {} eta {} lambda {}",
            hyperparams.alpha, hyperparams.eta, hyperparams.lambda
        );
        let program = device.build_program(source.text(), &defines)?;

        let (update, predict) = if vector_width > 1 {
            (VEC_UPDATE, VEC_PREDICT)
        } else {
            (UPDATE, PREDICT)
        };
        let dim = feature_dim as i32;

        Ok(Self {
            initialise: device.create_kernel(
                &program,
                INITIALISE,
                &[Buffer(&buffers.theta), Buffer(&buffers.w), Buffer(&buffers.trace), Int(dim)],
            )?,
            update: device.create_kernel(
                &program,
                update,
                &[
                    Buffer(&buffers.theta),
                    Buffer(&buffers.w),
                    Buffer(&buffers.trace),
                    Buffer(&buffers.prev_features),
                    Buffer(&buffers.next_features),
                    Buffer(&buffers.rho),
                    Buffer(&buffers.reward),
                    Buffer(&buffers.gamma),
                    Buffer(&buffers.prediction),
                    Int(dim),
                ],
            )?,
            predict: device.create_kernel(
                &program,
                predict,
                &[
                    Buffer(&buffers.theta),
                    Buffer(&buffers.prev_features),
                    Buffer(&buffers.prediction),
                    Int(dim),
                ],
            )?,
            trace_reset: device.create_kernel(
                &program,
                TRACE_RESET,
                &[Buffer(&buffers.trace), Int(dim)],
            )?,
            hyperparams,
            vector_width,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entry_is_named() {
        let text = "__kernel void initialise() {}\n__kernel void updateGTDLambda() {}";
        match KernelSource::from_text(text) {
            Err(HordeError::MissingEntryPoint { entry }) => assert_eq!(entry, VEC_UPDATE),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unreadable_source_is_fatal() {
        let err = KernelSource::load("does/not/exist.cl").unwrap_err();
        assert!(matches!(err, HordeError::KernelSource { .. }));
    }

    #[test]
    fn bundled_source_exports_every_entry() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/horde.cl");
        KernelSource::load(path).unwrap();
    }
}
