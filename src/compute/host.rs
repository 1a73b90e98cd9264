//! A CPU-emulated device.
//!
//! It runs the kernel entry points natively and synchronously, so every event it
//! hands out is already complete. It still checks what a real driver would check
//! (allocation limits, exported entry points, argument shapes, work-group divisibility)
//! and keeps statistics so callers can observe how the pipeline drives it.

mod kernels;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use super::{
    Backend, BufferUsage, Define, DeviceInfo, KernelArg, NdRange, Platform, exported_entries,
};
use crate::{
    config::Hyperparams,
    error::{HordeError, Result},
};

const FLOAT_BYTES: u64 = 4;

/// Counters describing everything a `HostDevice` was asked to do.
#[derive(Debug, Default)]
pub struct HostStats {
    allocations: AtomicUsize,
    allocated_bytes: AtomicU64,
    programs: AtomicUsize,
    writes: AtomicUsize,
    reads: AtomicUsize,
    dispatches: Mutex<HashMap<String, usize>>,
    waited: Mutex<Vec<u64>>,
}

impl HostStats {
    /// The amount of buffers allocated so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// The amount of bytes allocated so far.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// The amount of programs compiled so far.
    pub fn programs_built(&self) -> usize {
        self.programs.load(Ordering::Acquire)
    }

    /// The amount of host to device transfers so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// The amount of device to host transfers so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// The amount of launches of the given entry point.
    pub fn dispatches(&self, entry: &str) -> usize {
        self.dispatches.lock().get(entry).copied().unwrap_or(0)
    }

    /// The amount of launches of any entry point.
    pub fn total_dispatches(&self) -> usize {
        self.dispatches.lock().values().sum()
    }

    /// The ids of the events explicitly waited on, in order.
    pub fn waited(&self) -> Vec<u64> {
        self.waited.lock().clone()
    }
}

/// A completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    id: u64,
}

impl HostEvent {
    /// The device-unique, increasing id of the command.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Host memory standing in for a device buffer.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    data: Arc<RwLock<Vec<f32>>>,
    usage: BufferUsage,
}

impl HostBuffer {
    /// The usage hint given at allocation.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

/// A "compiled" program: its exported entry points and the constants baked into it.
#[derive(Debug, Clone)]
pub struct HostProgram {
    entries: Vec<String>,
    hyperparams: Hyperparams,
    vector_width: usize,
}

impl HostProgram {
    /// The constants the program was compiled with.
    pub fn hyperparams(&self) -> Hyperparams {
        self.hyperparams
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostEntry {
    Initialise,
    Update,
    Predict,
    TraceReset,
}

#[derive(Debug, Clone)]
enum HostArg {
    Buffer(HostBuffer),
    Int(i32),
}

/// A kernel with its arguments bound.
#[derive(Debug, Clone)]
pub struct HostKernel {
    name: String,
    entry: HostEntry,
    args: Vec<HostArg>,
    hyperparams: Hyperparams,
    demons_per_item: usize,
}

/// A device emulated on the host CPU.
#[derive(Debug, Clone)]
pub struct HostDevice {
    info: DeviceInfo,
    stats: Arc<HostStats>,
    next_event: Arc<AtomicU64>,
}

impl HostDevice {
    /// Creates a new `HostDevice` reporting the given properties.
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            stats: Arc::new(HostStats::default()),
            next_event: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a host device with the given memory limits and sensible defaults otherwise.
    ///
    /// # Arguments
    /// * `name` - The device name.
    /// * `global_mem_size` - Total memory in bytes.
    /// * `max_alloc_size` - Largest single allocation in bytes.
    pub fn with_memory(name: &str, global_mem_size: u64, max_alloc_size: u64) -> Self {
        Self::new(DeviceInfo {
            name: name.to_string(),
            vendor: "host".to_string(),
            global_mem_size,
            max_alloc_size,
            compute_units: 1,
            max_work_group_size: 1024,
            preferred_vector_width: 4,
        })
    }

    /// Returns a shared handle on the device statistics.
    pub fn stats(&self) -> Arc<HostStats> {
        Arc::clone(&self.stats)
    }

    fn event(&self) -> HostEvent {
        HostEvent {
            id: self.next_event.fetch_add(1, Ordering::AcqRel),
        }
    }

    fn err(&self, detail: impl std::fmt::Display) -> HordeError {
        HordeError::compute(&self.info.name, detail)
    }
}

/// A set of host devices.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    name: String,
    devices: Vec<HostDevice>,
}

impl HostPlatform {
    /// Creates a new `HostPlatform`.
    ///
    /// # Arguments
    /// * `name` - The platform name.
    /// * `devices` - The devices it exposes, opening hands out clones sharing the stats.
    pub fn new(name: &str, devices: Vec<HostDevice>) -> Self {
        Self {
            name: name.to_string(),
            devices,
        }
    }
}

impl Platform for HostPlatform {
    type Device = HostDevice;

    fn name(&self) -> &str {
        &self.name
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn open(&self) -> Result<Vec<HostDevice>> {
        Ok(self.devices.clone())
    }
}

impl Backend for HostDevice {
    type Buffer = HostBuffer;
    type Event = HostEvent;
    type Program = HostProgram;
    type Kernel = HostKernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, len: usize, usage: BufferUsage) -> Result<HostBuffer> {
        let bytes = len as u64 * FLOAT_BYTES;
        if len == 0 {
            return Err(self.err("zero sized buffer"));
        }
        if bytes > self.info.max_alloc_size {
            return Err(self.err(format!(
                "buffer of {bytes} bytes exceeds max allocation of {} bytes",
                self.info.max_alloc_size
            )));
        }

        let total = self.stats.allocated_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if total > self.info.global_mem_size {
            self.stats.allocated_bytes.fetch_sub(bytes, Ordering::AcqRel);
            return Err(self.err("out of device memory"));
        }
        self.stats.allocations.fetch_add(1, Ordering::AcqRel);

        Ok(HostBuffer {
            data: Arc::new(RwLock::new(vec![0.; len])),
            usage,
        })
    }

    fn build_program(&self, source: &str, defines: &[Define]) -> Result<HostProgram> {
        let mut hyperparams = Hyperparams::default();
        let mut vector_width = 1;

        for define in defines {
            let value = define.value.trim_end_matches('f');
            match define.name {
                "ALPHA" => hyperparams.alpha = parse_define(self, define, value)?,
                "ETA" => hyperparams.eta = parse_define(self, define, value)?,
                "LAMBDA" => hyperparams.lambda = parse_define(self, define, value)?,
                "VECTOR" => vector_width = parse_define(self, define, value)?,
                _ => {}
            }
        }

        self.stats.programs.fetch_add(1, Ordering::AcqRel);

        Ok(HostProgram {
            entries: exported_entries(source),
            hyperparams,
            vector_width,
        })
    }

    fn create_kernel(
        &self,
        program: &HostProgram,
        entry: &str,
        args: &[KernelArg<'_, HostBuffer>],
    ) -> Result<HostKernel> {
        if !program.entries.iter().any(|e| e == entry) {
            return Err(self.err(format!("program has no kernel named `{entry}`")));
        }

        let (kind, demons_per_item) = match entry {
            "initialise" => (HostEntry::Initialise, 1),
            "updateGTDLambda" => (HostEntry::Update, 1),
            "vec_updateGTDLambda" => (HostEntry::Update, program.vector_width),
            "predict" => (HostEntry::Predict, 1),
            "vec_predict" => (HostEntry::Predict, program.vector_width),
            "traceReset" => (HostEntry::TraceReset, 1),
            other => return Err(self.err(format!("no host implementation of `{other}`"))),
        };

        let args: Vec<HostArg> = args
            .iter()
            .map(|arg| match arg {
                KernelArg::Buffer(buffer) => HostArg::Buffer((*buffer).clone()),
                KernelArg::Int(value) => HostArg::Int(*value),
            })
            .collect();

        kernels::check_signature(kind, &args).map_err(|e| self.err(format!("{entry}: {e}")))?;

        Ok(HostKernel {
            name: entry.to_string(),
            entry: kind,
            args,
            hyperparams: program.hyperparams,
            demons_per_item,
        })
    }

    fn write(&self, buffer: &HostBuffer, data: &[f32], _wait: &[HostEvent]) -> Result<HostEvent> {
        let mut dst = buffer.data.write();
        if data.len() > dst.len() {
            return Err(self.err(format!(
                "write of {} floats into a buffer of {}",
                data.len(),
                dst.len()
            )));
        }

        dst[..data.len()].copy_from_slice(data);
        self.stats.writes.fetch_add(1, Ordering::AcqRel);
        Ok(self.event())
    }

    fn read(&self, buffer: &HostBuffer, out: &mut [f32], _wait: &[HostEvent]) -> Result<()> {
        let src = buffer.data.read();
        if out.len() > src.len() {
            return Err(self.err(format!(
                "read of {} floats from a buffer of {}",
                out.len(),
                src.len()
            )));
        }

        let len = out.len();
        out.copy_from_slice(&src[..len]);
        self.stats.reads.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn enqueue(
        &self,
        kernel: &HostKernel,
        range: NdRange,
        _wait: &[HostEvent],
    ) -> Result<HostEvent> {
        if range.local == 0 || range.global % range.local != 0 {
            return Err(self.err(format!(
                "global size {} isn't a multiple of work-group size {}",
                range.global, range.local
            )));
        }

        let demons = range.global * kernel.demons_per_item;
        kernels::run(kernel, demons).map_err(|e| self.err(format!("{}: {e}", kernel.name)))?;

        *self
            .stats
            .dispatches
            .lock()
            .entry(kernel.name.clone())
            .or_default() += 1;

        Ok(self.event())
    }

    fn wait(&self, event: &HostEvent) -> Result<()> {
        self.stats.waited.lock().push(event.id);
        Ok(())
    }
}

fn parse_define<T: std::str::FromStr>(
    device: &HostDevice,
    define: &Define,
    value: &str,
) -> Result<T> {
    value
        .parse()
        .map_err(|_| device.err(format!("invalid value for {}: {}", define.name, define.value)))
}
