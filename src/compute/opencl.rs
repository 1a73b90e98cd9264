//! The OpenCL backend, one context and one out-of-order queue per GPU.

use log::{debug, warn};
use ocl::{
    Buffer, Context, Device, Event, EventList, Kernel, Program, Queue,
    enums::{DeviceInfo as ClInfo, DeviceInfoResult as ClInfoResult},
    flags::{
        DEVICE_TYPE_GPU, MEM_READ_ONLY, MEM_READ_WRITE, MEM_WRITE_ONLY,
        QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE,
    },
};
use parking_lot::Mutex;

use super::{Backend, BufferUsage, Define, DeviceInfo, KernelArg, NdRange, Platform};
use crate::error::{HordeError, Result};

/// An OpenCL platform and the GPUs it exposes.
#[derive(Debug, Clone)]
pub struct OclPlatform {
    name: String,
    platform: ocl::Platform,
    devices: Vec<Device>,
}

impl OclPlatform {
    /// Lists every installed OpenCL platform with its GPU devices.
    ///
    /// Platforms whose devices can't be listed are reported with no device.
    pub fn list() -> Vec<OclPlatform> {
        ocl::Platform::list()
            .into_iter()
            .map(|platform| {
                let name = platform.name().unwrap_or_else(|_| "unknown".to_string());
                let devices = match Device::list(platform, Some(DEVICE_TYPE_GPU)) {
                    Ok(devices) => devices,
                    Err(e) => {
                        debug!(platform = name.as_str(); "can't list GPU devices: {e}");
                        Vec::new()
                    }
                };

                OclPlatform {
                    name,
                    platform,
                    devices,
                }
            })
            .collect()
    }
}

impl Platform for OclPlatform {
    type Device = OclDevice;

    fn name(&self) -> &str {
        &self.name
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn open(&self) -> Result<Vec<OclDevice>> {
        self.devices
            .iter()
            .map(|&device| OclDevice::open(self.platform, device))
            .collect()
    }
}

/// One opened GPU.
///
/// Non-blocking writes read host memory after `write` returns, so every write goes
/// through an owned staging copy that lives until its event completes.
#[derive(Debug)]
pub struct OclDevice {
    info: DeviceInfo,
    context: Context,
    queue: Queue,
    staging: Mutex<Vec<(Event, Vec<f32>)>>,
}

impl OclDevice {
    fn open(platform: ocl::Platform, device: Device) -> Result<Self> {
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let err = |e: ocl::Error| HordeError::compute(&name, e);

        let info = query_info(&device, &name).map_err(err)?;
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(err)?;

        let queue = match Queue::new(&context, device, Some(QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE)) {
            Ok(queue) => queue,
            Err(e) => {
                warn!(
                    device = name.as_str();
                    "out-of-order queue unsupported ({e}), using an in-order queue"
                );
                Queue::new(&context, device, None).map_err(err)?
            }
        };

        Ok(Self {
            info,
            context,
            queue,
            staging: Mutex::new(Vec::new()),
        })
    }

    fn err(&self, e: impl std::fmt::Display) -> HordeError {
        HordeError::compute(&self.info.name, e)
    }
}

fn query_info(device: &Device, name: &str) -> ocl::Result<DeviceInfo> {
    let global_mem_size = match device.info(ClInfo::GlobalMemSize)? {
        ClInfoResult::GlobalMemSize(bytes) => bytes,
        _ => 0,
    };
    let max_alloc_size = match device.info(ClInfo::MaxMemAllocSize)? {
        ClInfoResult::MaxMemAllocSize(bytes) => bytes,
        _ => 0,
    };
    let compute_units = match device.info(ClInfo::MaxComputeUnits)? {
        ClInfoResult::MaxComputeUnits(units) => units,
        _ => 1,
    };
    let preferred_vector_width = match device.info(ClInfo::PreferredVectorWidthFloat)? {
        ClInfoResult::PreferredVectorWidthFloat(width) => width,
        _ => 1,
    };

    Ok(DeviceInfo {
        name: name.to_string(),
        vendor: device.vendor().unwrap_or_default(),
        global_mem_size,
        max_alloc_size,
        compute_units,
        max_work_group_size: device.max_wg_size()?,
        preferred_vector_width,
    })
}

fn wait_list(events: &[Event]) -> EventList {
    let mut list = EventList::new();
    for event in events {
        list.push(event.clone());
    }
    list
}

impl Backend for OclDevice {
    type Buffer = Buffer<f32>;
    type Event = Event;
    type Program = Program;
    type Kernel = Kernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, len: usize, usage: BufferUsage) -> Result<Buffer<f32>> {
        let flags = match usage {
            BufferUsage::Input => MEM_READ_ONLY,
            BufferUsage::Output => MEM_WRITE_ONLY,
            BufferUsage::InputOutput => MEM_READ_WRITE,
        };

        Buffer::<f32>::builder()
            .queue(self.queue.clone())
            .flags(flags)
            .len(len)
            .fill_val(0.)
            .build()
            .map_err(|e| self.err(e))
    }

    fn build_program(&self, source: &str, defines: &[Define]) -> Result<Program> {
        let mut builder = Program::builder();
        builder.src(source).devices(self.queue.device());
        for define in defines {
            builder.cmplr_opt(format!("-D {}={}", define.name, define.value));
        }

        builder.build(&self.context).map_err(|e| self.err(e))
    }

    fn create_kernel(
        &self,
        program: &Program,
        entry: &str,
        args: &[KernelArg<'_, Buffer<f32>>],
    ) -> Result<Kernel> {
        let mut builder = Kernel::builder();
        builder.program(program).name(entry).queue(self.queue.clone());
        for arg in args {
            match arg {
                KernelArg::Buffer(buffer) => builder.arg(*buffer),
                KernelArg::Int(value) => builder.arg(*value),
            };
        }

        builder.build().map_err(|e| self.err(format!("{entry}: {e}")))
    }

    fn write(&self, buffer: &Buffer<f32>, data: &[f32], wait: &[Event]) -> Result<Event> {
        let staged = data.to_vec();
        let wait = wait_list(wait);
        let mut event = Event::empty();

        // SAFETY: `staged` is moved into `self.staging` below and only dropped once
        // the transfer reading it reports completion.
        unsafe {
            buffer
                .write(staged.as_slice())
                .queue(&self.queue)
                .block(false)
                .ewait(&wait)
                .enew(&mut event)
                .enq()
                .map_err(|e| self.err(e))?;
        }

        let mut staging = self.staging.lock();
        staging.retain(|(event, _)| !event.is_complete().unwrap_or(false));
        staging.push((event.clone(), staged));
        Ok(event)
    }

    fn read(&self, buffer: &Buffer<f32>, out: &mut [f32], wait: &[Event]) -> Result<()> {
        let wait = wait_list(wait);
        buffer
            .read(out)
            .queue(&self.queue)
            .ewait(&wait)
            .enq()
            .map_err(|e| self.err(e))
    }

    fn enqueue(&self, kernel: &Kernel, range: NdRange, wait: &[Event]) -> Result<Event> {
        let wait = wait_list(wait);
        let mut event = Event::empty();

        // SAFETY: every argument was bound at creation to a buffer owned by the same
        // worker, which outlives the dispatch.
        unsafe {
            kernel
                .cmd()
                .global_work_size(range.global)
                .local_work_size(range.local)
                .ewait(&wait)
                .enew(&mut event)
                .enq()
                .map_err(|e| self.err(e))?;
        }

        Ok(event)
    }

    fn wait(&self, event: &Event) -> Result<()> {
        event.wait_for().map_err(|e| self.err(e))
    }
}
