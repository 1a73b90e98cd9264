//! Everything one device owns: its buffers, its kernels and its pipeline.

mod buffers;
pub mod layout;
mod program;
mod worker;

pub use buffers::{DeviceBuffers, WeightKind};
pub use layout::{DevicePlan, StridedLayout, from_device_layout, to_device_layout};
pub use program::{CompiledProgram, KernelSource};
pub use worker::{DeviceWorker, WorkerState};
