use std::ops::Range;

use log::info;

use crate::{
    compute::DeviceInfo,
    config::HordeConfig,
    device::layout::DevicePlan,
    error::{HordeError, Result},
};

const FLOAT_BYTES: u64 = 4;

/// Splits a flat demon population into contiguous, balanced per-device blocks.
///
/// Properties:
/// - Blocks are contiguous, disjoint and cover `[0..demons)` in order.
/// - Block sizes differ by at most 1, the first `demons % devices` are the larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    demons: usize,
    devices: usize,
}

impl Partition {
    /// Creates a new `Partition`.
    ///
    /// # Panics
    /// If `devices` is zero.
    pub fn new(demons: usize, devices: usize) -> Self {
        assert!(devices > 0, "a partition needs at least one device");
        Self { demons, devices }
    }

    /// The total demon count.
    pub fn demons(&self) -> usize {
        self.demons
    }

    /// The device count.
    pub fn devices(&self) -> usize {
        self.devices
    }

    /// The global indices owned by `device`.
    ///
    /// # Panics
    /// If `device` is out of range.
    pub fn block(&self, device: usize) -> Range<usize> {
        assert!(device < self.devices, "device index out of range");

        let base = self.demons / self.devices;
        let rem = self.demons % self.devices;

        let start = device * base + device.min(rem);
        let extra = if device < rem { 1 } else { 0 };
        start..start + base + extra
    }

    /// Every block, in device order.
    pub fn blocks(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.devices).map(|d| self.block(d))
    }

    /// Maps a global demon index to its device and local index.
    ///
    /// # Panics
    /// If `global` is out of range.
    pub fn locate(&self, global: usize) -> (usize, usize) {
        assert!(
            global < self.demons,
            "demon index {global} out of range for {} demons",
            self.demons
        );

        let base = self.demons / self.devices;
        let rem = self.demons % self.devices;
        let big = rem * (base + 1);

        if global < big {
            (global / (base + 1), global % (base + 1))
        } else {
            let rest = global - big;
            (rem + rest / base, rest % base)
        }
    }

    /// The device owning demon `global`.
    ///
    /// # Panics
    /// If `global` is out of range.
    pub fn device_index(&self, global: usize) -> usize {
        self.locate(global).0
    }

    /// The local index of demon `global` on its device.
    ///
    /// # Panics
    /// If `global` is out of range.
    pub fn local_index(&self, global: usize) -> usize {
        self.locate(global).1
    }

    /// Checks that the population fits the devices before anything is allocated.
    ///
    /// Every device must hold one weight array of its padded block in a single
    /// allocation, and a conservative estimate of the whole population must fit the
    /// sum of every device's memory.
    ///
    /// # Arguments
    /// * `infos` - The devices in partition order.
    /// * `feature_dim` - The feature dimension.
    /// * `config` - The work-group and vectorization settings deciding the padding.
    pub fn check_memory(
        &self,
        infos: &[DeviceInfo],
        feature_dim: usize,
        config: &HordeConfig,
    ) -> Result<()> {
        let f = feature_dim as u64;
        let n = self.demons as u64;

        for (device, info) in infos.iter().enumerate() {
            let local = self.block(device).len();
            let plan = DevicePlan::new(info, local, config);
            let required = plan.weight_bytes(feature_dim).max(FLOAT_BYTES * f * local as u64);
            if required > info.max_alloc_size {
                return Err(HordeError::AllocationTooLarge {
                    device: info.name.clone(),
                    required,
                    available: info.max_alloc_size,
                });
            }
        }

        let required = 12 * f * n + 8 * f + 12 * n;
        let available = infos.iter().map(|info| info.global_mem_size).sum::<u64>();
        if required > available {
            return Err(HordeError::InsufficientMemory {
                required,
                available,
            });
        }

        info!(
            demons = self.demons, devices = self.devices;
            "partition fits: {required} of {available} bytes"
        );
        Ok(())
    }
}
