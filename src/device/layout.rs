use crate::{compute::DeviceInfo, config::HordeConfig};

/// The vector widths the vectorized kernels are written for.
const SUPPORTED_WIDTHS: [usize; 5] = [1, 2, 4, 8, 16];

/// Maps (demon, feature) pairs to offsets in a feature-major, demon-minor buffer.
///
/// Feature `j` of demon `i` lives at `i + j * padded`, so neighbouring work-items
/// read neighbouring floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedLayout {
    pub padded: usize,
    pub feature_dim: usize,
}

impl StridedLayout {
    /// Creates a new `StridedLayout`.
    ///
    /// # Arguments
    /// * `padded` - The padded demon count, the stride between features.
    /// * `feature_dim` - The amount of features per demon.
    pub fn new(padded: usize, feature_dim: usize) -> Self {
        Self {
            padded,
            feature_dim,
        }
    }

    /// The flat offset of feature `j` of demon `i`.
    #[inline]
    pub fn offset(&self, i: usize, j: usize) -> usize {
        i + j * self.padded
    }

    /// The amount of floats a buffer with this layout holds.
    pub fn buffer_len(&self) -> usize {
        self.padded * self.feature_dim
    }

    /// Writes one demon's flat vector into its strided slots.
    ///
    /// # Arguments
    /// * `device` - The strided buffer.
    /// * `demon` - The demon's local index.
    /// * `values` - Its `feature_dim` values.
    pub fn scatter(&self, device: &mut [f32], demon: usize, values: &[f32]) {
        for (j, &value) in values.iter().enumerate().take(self.feature_dim) {
            device[self.offset(demon, j)] = value;
        }
    }

    /// Reads one demon's strided slots into a flat vector.
    ///
    /// # Arguments
    /// * `device` - The strided buffer.
    /// * `demon` - The demon's local index.
    pub fn gather(&self, device: &[f32], demon: usize) -> Vec<f32> {
        (0..self.feature_dim)
            .map(|j| device[self.offset(demon, j)])
            .collect()
    }
}

/// Converts demon-major vectors into the strided device layout.
///
/// Padding slots and demons without a vector are left as they are in `device`.
///
/// # Arguments
/// * `layout` - The device layout.
/// * `per_demon` - One optional vector per real demon, in local order.
/// * `device` - The strided buffer to fill.
pub fn to_device_layout(layout: StridedLayout, per_demon: &[Option<&[f32]>], device: &mut [f32]) {
    for (i, values) in per_demon.iter().enumerate() {
        if let Some(values) = values {
            layout.scatter(device, i, values);
        }
    }
}

/// Converts the strided device layout back into one vector per real demon.
///
/// # Arguments
/// * `layout` - The device layout.
/// * `demons` - The real (unpadded) demon count.
/// * `device` - The strided buffer.
pub fn from_device_layout(layout: StridedLayout, demons: usize, device: &[f32]) -> Vec<Vec<f32>> {
    (0..demons).map(|i| layout.gather(device, i)).collect()
}

/// Rounds `local` up to a whole amount of work-groups of vectors.
///
/// A device with no demons still gets one group so its buffers are never empty.
///
/// # Arguments
/// * `local` - The device's real demon count.
/// * `vector_width` - Demons handled per work-item.
/// * `work_group_size` - Work-items per group.
pub fn padded_count(local: usize, vector_width: usize, work_group_size: usize) -> usize {
    let group = vector_width * work_group_size;
    local.max(1).div_ceil(group) * group
}

/// Picks the kernel vector width from the device's preferred float width.
///
/// # Returns
/// The preferred width when vectorizing and the kernels support it, `1` otherwise.
pub fn vector_width(preferred: u32, vectorize: bool) -> usize {
    let preferred = preferred.max(1) as usize;
    if vectorize && SUPPORTED_WIDTHS.contains(&preferred) {
        preferred
    } else {
        1
    }
}

/// The kernel geometry a device will use for its block of demons.
///
/// It depends only on the device's reported limits and the configuration, so it
/// can be computed for every device before any of them allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePlan {
    pub vector_width: usize,
    pub work_group_size: usize,
    pub padded: usize,
}

impl DevicePlan {
    /// Creates a new `DevicePlan`.
    ///
    /// # Arguments
    /// * `info` - The device's limits.
    /// * `local` - The device's real demon count.
    /// * `config` - The requested work-group size and vectorization.
    pub fn new(info: &DeviceInfo, local: usize, config: &HordeConfig) -> Self {
        let vector_width = vector_width(info.preferred_vector_width, config.vectorize);
        let work_group_size = config
            .work_group_size
            .clamp(1, info.max_work_group_size.max(1));

        Self {
            vector_width,
            work_group_size,
            padded: padded_count(local, vector_width, work_group_size),
        }
    }

    /// The bytes of one weight array, the largest single allocation of the device.
    pub fn weight_bytes(&self, feature_dim: usize) -> u64 {
        (StridedLayout::new(self.padded, feature_dim).buffer_len() * size_of::<f32>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn offsets_are_feature_major() {
        let layout = StridedLayout::new(8, 3);
        assert_eq!(layout.offset(0, 0), 0);
        assert_eq!(layout.offset(5, 0), 5);
        assert_eq!(layout.offset(5, 2), 21);
        assert_eq!(layout.buffer_len(), 24);
    }

    #[test]
    fn conversion_keeps_every_demon_vector() {
        let mut rng = rand::rng();
        let layout = StridedLayout::new(4, 5);
        let vectors: Vec<Vec<f32>> = (0..3)
            .map(|_| (0..5).map(|_| rng.random::<f32>()).collect())
            .collect();

        let mut device = vec![-1.; layout.buffer_len()];
        let per_demon: Vec<_> = vectors.iter().map(|v| Some(v.as_slice())).collect();
        to_device_layout(layout, &per_demon, &mut device);

        assert_eq!(from_device_layout(layout, 3, &device), vectors);
        // Padding slot untouched.
        assert!((0..5).all(|j| device[layout.offset(3, j)] == -1.));
    }

    #[test]
    fn absent_vectors_keep_device_values() {
        let layout = StridedLayout::new(2, 2);
        let mut device = vec![0., 0., 0., 0.];
        let values = [1., 2.];
        to_device_layout(layout, &[None, Some(&values[..])], &mut device);
        assert_eq!(device, [0., 1., 0., 2.]);
    }

    #[test]
    fn padding_is_a_whole_group() {
        for local in [0, 1, 63, 64, 65, 1000] {
            for (width, group) in [(1, 64), (4, 64), (8, 1), (16, 32)] {
                let padded = padded_count(local, width, group);
                assert_eq!(padded % (width * group), 0);
                assert!(padded >= local.max(1));
                assert!(padded - local.max(1) < width * group);
            }
        }
    }

    #[test]
    fn unsupported_widths_fall_back_to_scalar() {
        assert_eq!(vector_width(4, true), 4);
        assert_eq!(vector_width(4, false), 1);
        assert_eq!(vector_width(0, true), 1);
        assert_eq!(vector_width(3, true), 1);
    }

    fn info(max_work_group_size: usize, preferred_vector_width: u32) -> DeviceInfo {
        DeviceInfo {
            name: "gpu".to_string(),
            vendor: "test".to_string(),
            global_mem_size: 1 << 30,
            max_alloc_size: 1 << 28,
            compute_units: 8,
            max_work_group_size,
            preferred_vector_width,
        }
    }

    #[test]
    fn plan_pads_to_whole_vector_groups() {
        let plan = DevicePlan::new(&info(1024, 4), 5, &HordeConfig::default());

        assert_eq!(plan.vector_width, 4);
        assert_eq!(plan.work_group_size, 64);
        assert_eq!(plan.padded, 256);
        assert_eq!(plan.weight_bytes(10), 4 * 10 * 256);
    }

    #[test]
    fn plan_clamps_the_work_group() {
        let config = HordeConfig {
            work_group_size: 0,
            ..HordeConfig::default()
        };
        assert_eq!(DevicePlan::new(&info(16, 1), 3, &config).work_group_size, 1);

        let plan = DevicePlan::new(&info(16, 1), 20, &HordeConfig::default());
        assert_eq!(plan.work_group_size, 16);
        assert_eq!(plan.padded, 32);
    }

    #[test]
    fn plan_never_reserves_less_than_the_block() {
        for local in [0, 1, 50, 257] {
            let plan = DevicePlan::new(&info(64, 8), local, &HordeConfig::default());
            assert!(plan.weight_bytes(7) >= (4 * 7 * local) as u64);
        }
    }
}
