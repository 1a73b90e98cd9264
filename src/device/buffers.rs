use log::debug;

use super::layout::StridedLayout;
use crate::{
    compute::{Backend, BufferUsage},
    error::Result,
};

/// The learned vectors of a device, each one in the strided layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    Theta,
    W,
    Trace,
}

impl WeightKind {
    /// Every weight array, in kernel argument order.
    pub const ALL: [WeightKind; 3] = [WeightKind::Theta, WeightKind::W, WeightKind::Trace];

    /// The array's name as used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            WeightKind::Theta => "theta",
            WeightKind::W => "w",
            WeightKind::Trace => "trace",
        }
    }
}

/// Every buffer a device worker owns, allocated once at initialization.
#[derive(Debug)]
pub struct DeviceBuffers<Buf> {
    pub theta: Buf,
    pub w: Buf,
    pub trace: Buf,
    pub reward: Buf,
    pub gamma: Buf,
    pub rho: Buf,
    pub prediction: Buf,
    pub prev_features: Buf,
    pub next_features: Buf,
}

impl<Buf> DeviceBuffers<Buf> {
    /// Allocates the buffer set on `device`.
    ///
    /// # Arguments
    /// * `device` - The owning device.
    /// * `layout` - The weight layout, giving the padded demon count and feature dimension.
    ///
    /// # Returns
    /// The buffers or the first allocation failure.
    pub fn allocate<B>(device: &B, layout: StridedLayout) -> Result<Self>
    where
        B: Backend<Buffer = Buf>,
    {
        let weights = layout.buffer_len();
        let scalars = layout.padded;
        let features = layout.feature_dim;

        debug!(
            device = device.info().name.as_str();
            "allocating {} bytes of weights per array",
            weights * size_of::<f32>()
        );

        Ok(Self {
            theta: device.create_buffer(weights, BufferUsage::InputOutput)?,
            w: device.create_buffer(weights, BufferUsage::InputOutput)?,
            trace: device.create_buffer(weights, BufferUsage::InputOutput)?,
            reward: device.create_buffer(scalars, BufferUsage::Input)?,
            gamma: device.create_buffer(scalars, BufferUsage::Input)?,
            rho: device.create_buffer(scalars, BufferUsage::Input)?,
            prediction: device.create_buffer(scalars, BufferUsage::Output)?,
            prev_features: device.create_buffer(features, BufferUsage::Input)?,
            next_features: device.create_buffer(features, BufferUsage::Input)?,
        })
    }

    /// Returns the buffer holding the given weights.
    pub fn weights(&self, kind: WeightKind) -> &Buf {
        match kind {
            WeightKind::Theta => &self.theta,
            WeightKind::W => &self.w,
            WeightKind::Trace => &self.trace,
        }
    }
}
