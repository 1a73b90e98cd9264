use std::sync::Arc;

use log::info;
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

use super::{discovery, partition::Partition};
use crate::{
    compute::{Backend, Platform},
    config::{HordeConfig, Hyperparams},
    demon::{Demon, GammaFunction, OutcomeFunction, RewardFunction, Step},
    device::{DeviceWorker, KernelSource, WeightKind},
    error::{HordeError, Result},
};

/// Builds an `Orchestrator` from the demon population and its shared functions.
pub struct OrchestratorBuilder<A> {
    feature_dim: usize,
    demons: Vec<Demon<A>>,
    rewards: Vec<Arc<dyn RewardFunction<A>>>,
    outcomes: Vec<Arc<dyn OutcomeFunction<A>>>,
    gammas: Vec<Arc<dyn GammaFunction<A>>>,
    config: HordeConfig,
}

impl<A: Sync> OrchestratorBuilder<A> {
    /// Creates a new `OrchestratorBuilder`.
    ///
    /// # Arguments
    /// * `feature_dim` - The length of every feature vector.
    pub fn new(feature_dim: usize) -> Self {
        Self {
            feature_dim,
            demons: Vec::new(),
            rewards: Vec::new(),
            outcomes: Vec::new(),
            gammas: Vec::new(),
            config: HordeConfig::default(),
        }
    }

    /// Sets the demon population, in global order.
    pub fn demons(mut self, demons: impl IntoIterator<Item = Demon<A>>) -> Self {
        self.demons = demons.into_iter().collect();
        self
    }

    /// Registers the reward functions updated once per tick.
    pub fn reward_functions(
        mut self,
        functions: impl IntoIterator<Item = Arc<dyn RewardFunction<A>>>,
    ) -> Self {
        self.rewards = functions.into_iter().collect();
        self
    }

    /// Registers the outcome functions updated once per tick.
    pub fn outcome_functions(
        mut self,
        functions: impl IntoIterator<Item = Arc<dyn OutcomeFunction<A>>>,
    ) -> Self {
        self.outcomes = functions.into_iter().collect();
        self
    }

    /// Registers the gamma functions updated once per tick.
    pub fn gamma_functions(
        mut self,
        functions: impl IntoIterator<Item = Arc<dyn GammaFunction<A>>>,
    ) -> Self {
        self.gammas = functions.into_iter().collect();
        self
    }

    /// Replaces the default configuration.
    pub fn config(mut self, config: HordeConfig) -> Self {
        self.config = config;
        self
    }

    /// Discovers the devices, partitions the demons and initializes every worker.
    ///
    /// Memory is checked against every device, padding included, before the first
    /// buffer is allocated.
    ///
    /// # Arguments
    /// * `platforms` - Every installed platform.
    ///
    /// # Returns
    /// A ready `Orchestrator` or the first fatal configuration error.
    pub fn build<P>(self, platforms: &[P]) -> Result<Orchestrator<P::Device, A>>
    where
        P: Platform,
    {
        let devices = discovery::discover(platforms)?;
        let partition = Partition::new(self.demons.len(), devices.len());

        let infos: Vec<_> = devices.iter().map(|d| d.info().clone()).collect();
        partition.check_memory(&infos, self.feature_dim, &self.config)?;

        let source = KernelSource::load(&self.config.kernel_path)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(devices.len())
            .thread_name(|i| format!("horde-device-{i}"))
            .build()?;

        let mut demons = self.demons.into_iter();
        let mut workers = Vec::with_capacity(devices.len());
        for (index, device) in devices.into_iter().enumerate() {
            let block = partition.block(index);
            info!(device = index; "assigned demons {block:?}");

            let mut worker = DeviceWorker::new(index, device);
            let local = demons.by_ref().take(block.len()).collect();
            worker.initialize(local, self.feature_dim, &self.config, &source)?;
            workers.push(worker);
        }

        Ok(Orchestrator {
            partition,
            feature_dim: self.feature_dim,
            workers,
            rewards: self.rewards,
            outcomes: self.outcomes,
            gammas: self.gammas,
            pool: Some(pool),
        })
    }
}

/// Runs a horde of demons across every device of one platform.
///
/// Each device has its own worker and calls fan out to all of them on a pool with
/// one thread per device, returning once every device is done.
pub struct Orchestrator<B: Backend, A> {
    partition: Partition,
    feature_dim: usize,
    workers: Vec<DeviceWorker<B, A>>,
    rewards: Vec<Arc<dyn RewardFunction<A>>>,
    outcomes: Vec<Arc<dyn OutcomeFunction<A>>>,
    gammas: Vec<Arc<dyn GammaFunction<A>>>,
    pool: Option<ThreadPool>,
}

impl<B: Backend, A: Sync> Orchestrator<B, A> {
    /// Runs one tick.
    ///
    /// Every registered function sees the transition first, on the calling thread,
    /// then every device runs its update.
    ///
    /// # Arguments
    /// * `observation` - The raw observation, if any.
    /// * `prev` - The previous features, `None` on the first tick of an episode.
    /// * `action` - The action taken.
    /// * `next` - The current features.
    pub fn update(
        &mut self,
        observation: Option<&[f64]>,
        prev: Option<&[f64]>,
        action: &A,
        next: &[f64],
    ) -> Result<()> {
        if let Some(prev) = prev {
            self.check_dim(prev)?;
        }
        self.check_dim(next)?;

        let step = Step {
            observation,
            prev,
            action,
            next,
        };

        for reward in &self.rewards {
            reward.update(&step);
        }
        for gamma in &self.gammas {
            gamma.update(&step);
        }
        for outcome in &self.outcomes {
            outcome.update(&step);
        }

        self.for_each_worker(|worker| worker.update(&step))
    }

    /// Returns every demon's prediction in global order.
    ///
    /// # Arguments
    /// * `features` - The state to predict for, `None` re-reads the last predictions.
    pub fn predictions(&mut self, features: Option<&[f64]>) -> Result<Vec<f32>> {
        if let Some(features) = features {
            self.check_dim(features)?;
        }

        let pool = self.pool.as_ref().ok_or(HordeError::ShutDown)?;
        let workers = &mut self.workers;

        let per_device = pool.install(|| {
            workers
                .par_iter_mut()
                .with_max_len(1)
                .map(|worker| worker.predictions(features))
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(per_device.concat())
    }

    /// Recompiles the kernels of every device.
    pub fn set_params(&mut self, hyperparams: Hyperparams) -> Result<()> {
        self.for_each_worker(|worker| worker.set_params(hyperparams))
    }

    /// Recompiles the kernels of one device.
    ///
    /// # Arguments
    /// * `device` - The device index in partition order.
    /// * `hyperparams` - The new learning constants.
    pub fn set_device_params(&mut self, device: usize, hyperparams: Hyperparams) -> Result<()> {
        if self.pool.is_none() {
            return Err(HordeError::ShutDown);
        }

        let devices = self.workers.len();
        self.workers
            .get_mut(device)
            .ok_or(HordeError::DeviceIndex {
                index: device,
                devices,
            })?
            .set_params(hyperparams)
    }

    /// Every demon's `theta`, demon after demon, in device order.
    pub fn theta(&self) -> Result<Vec<f32>> {
        self.weights(WeightKind::Theta)
    }

    /// Every demon's `w`, demon after demon, in device order.
    pub fn w(&self) -> Result<Vec<f32>> {
        self.weights(WeightKind::W)
    }

    /// Every demon's eligibility trace, demon after demon, in device order.
    pub fn trace(&self) -> Result<Vec<f32>> {
        self.weights(WeightKind::Trace)
    }

    /// Reads one weight array from every device, one device at a time.
    pub fn weights(&self, kind: WeightKind) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(self.partition.demons() * self.feature_dim);
        for worker in &self.workers {
            out.extend(worker.weights(kind)?);
        }
        Ok(out)
    }

    /// Copies every device's weights into its demons' snapshots.
    pub fn save_weights(&mut self) -> Result<()> {
        self.for_each_worker(DeviceWorker::save_weights)
    }

    /// Uploads every demon's snapshot to its device.
    pub fn upload_weights(&mut self) -> Result<()> {
        self.for_each_worker(DeviceWorker::upload_weights)
    }

    /// Scans every device for NaN, one device at a time.
    pub fn check_for_nan(&self) -> Result<()> {
        self.workers.iter().try_for_each(DeviceWorker::check_for_nan)
    }

    /// Stops the worker pool.
    ///
    /// Work already running on the devices isn't cancelled, later fan-out calls
    /// fail with `ShutDown`.
    pub fn shutdown(&mut self) {
        if self.pool.take().is_some() {
            info!("worker pool shut down");
        }
    }

    /// The device owning demon `global`.
    ///
    /// # Panics
    /// If `global` is out of range.
    pub fn device_index(&self, global: usize) -> usize {
        self.partition.device_index(global)
    }

    /// The local index of demon `global` on its device.
    ///
    /// # Panics
    /// If `global` is out of range.
    pub fn local_index(&self, global: usize) -> usize {
        self.partition.local_index(global)
    }

    /// The demon at global index `global`.
    ///
    /// # Panics
    /// If `global` is out of range.
    pub fn demon(&self, global: usize) -> &Demon<A> {
        let (device, local) = self.partition.locate(global);
        &self.workers[device].demons()[local]
    }

    /// Mutable access to the demon at global index `global`.
    ///
    /// # Panics
    /// If `global` is out of range.
    pub fn demon_mut(&mut self, global: usize) -> &mut Demon<A> {
        let (device, local) = self.partition.locate(global);
        &mut self.workers[device].demons_mut()[local]
    }

    /// Every demon, in global order.
    pub fn demons(&self) -> impl Iterator<Item = &Demon<A>> {
        self.workers.iter().flat_map(|worker| worker.demons())
    }

    /// The device workers, in partition order.
    pub fn workers(&self) -> &[DeviceWorker<B, A>] {
        &self.workers
    }

    /// The demon partition.
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// The length of every feature vector.
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn for_each_worker<F>(&mut self, op: F) -> Result<()>
    where
        F: Fn(&mut DeviceWorker<B, A>) -> Result<()> + Send + Sync,
    {
        let pool = self.pool.as_ref().ok_or(HordeError::ShutDown)?;
        let workers = &mut self.workers;

        pool.install(|| workers.par_iter_mut().with_max_len(1).try_for_each(op))
    }

    fn check_dim(&self, features: &[f64]) -> Result<()> {
        if features.len() == self.feature_dim {
            Ok(())
        } else {
            Err(HordeError::FeatureDimension {
                expected: self.feature_dim,
                got: features.len(),
            })
        }
    }
}
