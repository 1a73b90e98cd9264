//! The slice of a heterogeneous compute API the horde relies on.
//!
//! It follows the OpenCL model: platforms expose devices, every device owns a context
//! and an out-of-order queue, and every enqueued transfer or kernel launch returns an
//! event that later commands can depend on. Ordering between commands on one device is
//! expressed only through those events.

mod host;
#[cfg(feature = "opencl")]
mod opencl;

use std::fmt;

pub use host::{HostBuffer, HostDevice, HostEvent, HostKernel, HostPlatform, HostProgram, HostStats};
#[cfg(feature = "opencl")]
pub use opencl::{OclDevice, OclPlatform};

use crate::error::Result;

/// How a kernel uses a buffer, given to the driver as an allocation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Input,
    Output,
    InputOutput,
}

/// A kernel argument, bound once when the kernel is created.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    Int(i32),
}

/// The launch geometry of a one dimensional kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: usize,
    pub local: usize,
}

/// A compile-time macro definition, `-D name=value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Define {
    pub name: &'static str,
    pub value: String,
}

impl Define {
    /// Creates a new `Define`.
    pub fn new(name: &'static str, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }

    /// Defines a single precision float literal, e.g. `0.1f`.
    pub fn float(name: &'static str, value: f32) -> Self {
        Self::new(name, format!("{value:?}f"))
    }
}

/// Static properties of a device, queried once at discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    /// Total global memory in bytes.
    pub global_mem_size: u64,
    /// Largest single buffer allocation in bytes.
    pub max_alloc_size: u64,
    pub compute_units: u32,
    pub max_work_group_size: usize,
    /// Preferred float vector width, `0` or `1` when vectors aren't worth it.
    pub preferred_vector_width: u32,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} MiB global, {} MiB max alloc, {} compute units, max group {}, float vector width {}",
            self.name,
            self.vendor,
            self.global_mem_size / (1024 * 1024),
            self.max_alloc_size / (1024 * 1024),
            self.compute_units,
            self.max_work_group_size,
            self.preferred_vector_width,
        )
    }
}

/// Lists the names of every `__kernel void name(` in `source`.
pub(crate) fn exported_entries(source: &str) -> Vec<String> {
    source
        .split("__kernel")
        .skip(1)
        .filter_map(|rest| {
            let rest = rest.trim_start().strip_prefix("void")?;
            let name: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();

            (!name.is_empty()).then_some(name)
        })
        .collect()
}

/// A set of devices sharing a driver.
pub trait Platform {
    type Device: Backend;

    /// The platform's name as reported by the driver.
    fn name(&self) -> &str;

    /// The amount of usable devices, without opening them.
    fn device_count(&self) -> usize;

    /// Opens every usable device, each with its own context and queue.
    ///
    /// # Returns
    /// The opened devices or a compute error.
    fn open(&self) -> Result<Vec<Self::Device>>;
}

/// One opened device: a context plus an out-of-order command queue.
///
/// Writes and kernel launches are asynchronous and return an event, reads block
/// the calling thread until the data is on the host.
pub trait Backend: Send {
    type Buffer: Send;
    type Event: Clone + Send;
    type Program: Send;
    type Kernel: Send;

    /// Returns the device's static properties.
    fn info(&self) -> &DeviceInfo;

    /// Allocates a zero-initialized buffer of `len` floats.
    fn create_buffer(&self, len: usize, usage: BufferUsage) -> Result<Self::Buffer>;

    /// Compiles a program from source with the given macro definitions.
    fn build_program(&self, source: &str, defines: &[Define]) -> Result<Self::Program>;

    /// Creates a kernel for `entry` with all its arguments bound.
    fn create_kernel(
        &self,
        program: &Self::Program,
        entry: &str,
        args: &[KernelArg<'_, Self::Buffer>],
    ) -> Result<Self::Kernel>;

    /// Enqueues a host to device copy once every event in `wait` completed.
    ///
    /// The host data is captured at call time, `data` may be reused right after.
    fn write(&self, buffer: &Self::Buffer, data: &[f32], wait: &[Self::Event])
    -> Result<Self::Event>;

    /// Copies a device buffer into `out` once every event in `wait` completed.
    fn read(&self, buffer: &Self::Buffer, out: &mut [f32], wait: &[Self::Event]) -> Result<()>;

    /// Enqueues a kernel launch once every event in `wait` completed.
    fn enqueue(
        &self,
        kernel: &Self::Kernel,
        range: NdRange,
        wait: &[Self::Event],
    ) -> Result<Self::Event>;

    /// Blocks until `event` completed.
    fn wait(&self, event: &Self::Event) -> Result<()>;
}
