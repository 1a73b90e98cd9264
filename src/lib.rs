//! A horde of off-policy GTD(λ) learners run across one or more compute devices.
//!
//! Demons share one stream of feature vectors but each learns its own value
//! estimate. The numerically heavy update runs on the devices: the population is
//! split into contiguous blocks, one per device, and each device keeps its block's
//! weights in a strided layout and pipelines updates one tick deep.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use horde::{
//!     OrchestratorBuilder,
//!     compute::{HostDevice, HostPlatform},
//!     demon::{ConstantGamma, ConstantOutcome, ConstantReward, Demon, UniformPolicy},
//! };
//!
//! let policy = Arc::new(UniformPolicy::new(2));
//! let demons = (0..8).map(|_| {
//!     Demon::new(
//!         policy.clone(),
//!         policy.clone(),
//!         Arc::new(ConstantReward(0.1)),
//!         Arc::new(ConstantGamma(0.9)),
//!         Arc::new(ConstantOutcome(0.)),
//!     )
//! });
//!
//! let platform = HostPlatform::new("host", vec![HostDevice::with_memory("cpu", 1 << 26, 1 << 24)]);
//! let mut horde = OrchestratorBuilder::new(3).demons(demons).build(&[platform])?;
//!
//! horde.update(None, None, &0usize, &[1., 0., 0.])?;
//! horde.update(None, Some(&[1., 0., 0.]), &1usize, &[0., 1., 0.])?;
//! let predictions = horde.predictions(None)?;
//! # Ok::<(), horde::HordeError>(())
//! ```

pub mod compute;
pub mod config;
pub mod demon;
pub mod device;
pub mod error;
pub mod orchestra;

pub use config::{HordeConfig, Hyperparams};
pub use error::{HordeError, Result};
pub use orchestra::{Orchestrator, OrchestratorBuilder, Partition};
