use log::{debug, warn};

use super::{
    buffers::{DeviceBuffers, WeightKind},
    layout::{self, DevicePlan, StridedLayout},
    program::{CompiledProgram, KernelSource},
};
use crate::{
    compute::{Backend, NdRange},
    config::{HordeConfig, Hyperparams},
    demon::{Demon, DemonWeights, Step, StepArrays},
    error::{HordeError, Result},
};

/// Where a worker stands in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    /// Initialized with nothing in flight.
    Idle,
    /// Exactly one update (or trace reset) may still be running on the device.
    UpdatePending,
}

/// Everything a worker owns once initialized.
struct Ready<B: Backend> {
    layout: StridedLayout,
    work_group_size: usize,
    buffers: DeviceBuffers<B::Buffer>,
    program: CompiledProgram<B>,
    source: KernelSource,
}

impl<B: Backend> Ready<B> {
    /// The geometry of kernels handling one demon per work-item.
    fn scalar_range(&self) -> NdRange {
        NdRange {
            global: self.layout.padded,
            local: self.work_group_size,
        }
    }

    /// The geometry of the update and predict kernels.
    fn vector_range(&self) -> NdRange {
        NdRange {
            global: self.layout.padded / self.program.vector_width,
            local: self.work_group_size,
        }
    }
}

/// Owns one device: its buffers, its compiled kernels and its demons.
///
/// Updates are pipelined one tick deep: an update waits for the previous tick's
/// kernel, never for the one it just issued.
pub struct DeviceWorker<B: Backend, A> {
    index: usize,
    device: B,
    demons: Vec<Demon<A>>,
    feature_dim: usize,
    arrays: StepArrays,
    ready: Option<Ready<B>>,
    pending: Option<B::Event>,
    last: Option<Vec<f32>>,
}

impl<B: Backend, A> DeviceWorker<B, A> {
    /// Creates a new uninitialized `DeviceWorker`.
    ///
    /// # Arguments
    /// * `index` - The device's position in the partition.
    /// * `device` - The opened device.
    pub fn new(index: usize, device: B) -> Self {
        Self {
            index,
            device,
            demons: Vec::new(),
            feature_dim: 0,
            arrays: StepArrays::zeroed(0),
            ready: None,
            pending: None,
            last: None,
        }
    }

    /// Allocates the device buffers, compiles the kernels and binds the demons.
    ///
    /// Weights start at zero, then every demon's stored snapshot is uploaded on top.
    ///
    /// # Arguments
    /// * `demons` - The demons of this device, in global order.
    /// * `feature_dim` - The feature dimension shared by every demon.
    /// * `config` - Work-group, vectorization and hyperparameter settings.
    /// * `source` - The kernel source.
    pub fn initialize(
        &mut self,
        mut demons: Vec<Demon<A>>,
        feature_dim: usize,
        config: &HordeConfig,
        source: &KernelSource,
    ) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            self.device.wait(&pending)?;
        }

        let info = self.device.info();
        let DevicePlan {
            vector_width,
            work_group_size,
            padded,
        } = DevicePlan::new(info, demons.len(), config);

        if work_group_size != config.work_group_size {
            warn!(
                device = info.name.as_str();
                "work-group size {} clamped to {work_group_size}",
                config.work_group_size
            );
        }
        if config.vectorize && vector_width != info.preferred_vector_width.max(1) as usize {
            warn!(
                device = info.name.as_str();
                "unsupported float vector width {}, falling back to scalar kernels",
                info.preferred_vector_width
            );
        }

        debug!(
            device = info.name.as_str(), demons = demons.len(), padded = padded;
            "initializing with vector width {vector_width}, work-group size {work_group_size}"
        );

        let layout = StridedLayout::new(padded, feature_dim);
        let buffers = DeviceBuffers::allocate(&self.device, layout)?;
        let program = CompiledProgram::build(
            &self.device,
            source,
            &buffers,
            feature_dim,
            config.hyperparams,
            vector_width,
        )?;

        let ready = Ready {
            layout,
            work_group_size,
            buffers,
            program,
            source: source.clone(),
        };

        let init = self
            .device
            .enqueue(&ready.program.initialise, ready.scalar_range(), &[])?;
        self.device.wait(&init)?;

        for (slot, demon) in demons.iter_mut().enumerate() {
            demon.bind(slot);
        }

        self.demons = demons;
        self.feature_dim = feature_dim;
        self.arrays = StepArrays::zeroed(padded);
        self.ready = Some(ready);
        self.last = None;

        self.upload_weights()
    }

    /// Runs one learning step on every demon of the device.
    ///
    /// Without previous features it only resets the traces. Otherwise the step
    /// scalars and both feature vectors are transferred after the previous update,
    /// the update kernel is launched after all five transfers, and only then is the
    /// previous update awaited.
    ///
    /// # Arguments
    /// * `step` - The transition of this tick.
    pub fn update(&mut self, step: &Step<'_, A>) -> Result<()> {
        let ready = self.ready.as_ref().ok_or(HordeError::Uninitialized)?;
        let after: Vec<B::Event> = self.pending.iter().cloned().collect();

        let Some(prev) = step.prev else {
            let reset = self
                .device
                .enqueue(&ready.program.trace_reset, ready.scalar_range(), &after)?;
            self.last = None;
            return self.defer(reset);
        };

        self.check_dim(prev)?;
        self.check_dim(step.next)?;

        let buffers = &ready.buffers;
        let arrays = &mut self.arrays;

        for demon in &self.demons {
            demon.update_reward(&mut arrays.reward);
        }
        let reward = self.device.write(&buffers.reward, &arrays.reward, &after)?;

        for demon in &self.demons {
            demon.update_gamma(&mut arrays.gamma);
        }
        let gamma = self.device.write(&buffers.gamma, &arrays.gamma, &after)?;

        for demon in &self.demons {
            demon.update_rho(prev, step.action, &mut arrays.rho);
        }
        let rho = self.device.write(&buffers.rho, &arrays.rho, &after)?;

        let prev = to_f32(prev);
        let next = to_f32(step.next);
        let transfers = [
            reward,
            gamma,
            rho,
            self.device.write(&buffers.prev_features, &prev, &after)?,
            self.device.write(&buffers.next_features, &next, &after)?,
        ];
        let update = self
            .device
            .enqueue(&ready.program.update, ready.vector_range(), &transfers)?;

        self.last = Some(prev);
        self.defer(update)
    }

    /// Returns the prediction of every real demon of the device.
    ///
    /// Nothing is launched when `features` is absent or equal to the last features
    /// predicted for, the current prediction buffer is read instead.
    ///
    /// # Arguments
    /// * `features` - The state to predict for.
    pub fn predictions(&mut self, features: Option<&[f64]>) -> Result<Vec<f32>> {
        let ready = self.ready.as_ref().ok_or(HordeError::Uninitialized)?;
        let mut wait: Vec<B::Event> = self.pending.iter().cloned().collect();

        if let Some(features) = features {
            self.check_dim(features)?;
            let features = to_f32(features);

            if self.last.as_deref() == Some(features.as_slice()) {
                debug!(device = self.device.info().name.as_str(); "prediction cache hit");
            } else {
                let write = self
                    .device
                    .write(&ready.buffers.prev_features, &features, &wait)?;
                let predict =
                    self.device
                        .enqueue(&ready.program.predict, ready.vector_range(), &[write])?;

                wait = vec![predict];
                self.last = Some(features);
            }
        }

        let mut out = vec![0.; self.demons.len()];
        if !out.is_empty() {
            self.device.read(&ready.buffers.prediction, &mut out, &wait)?;
        }
        Ok(out)
    }

    /// Recompiles the kernels with new hyperparameters.
    ///
    /// The new program replaces the old one whole, a dispatch still in flight keeps
    /// running with the kernels it was launched with.
    ///
    /// # Arguments
    /// * `hyperparams` - The new learning constants.
    pub fn set_params(&mut self, hyperparams: Hyperparams) -> Result<()> {
        let ready = self.ready.as_mut().ok_or(HordeError::Uninitialized)?;

        ready.program = CompiledProgram::build(
            &self.device,
            &ready.source,
            &ready.buffers,
            self.feature_dim,
            hyperparams,
            ready.program.vector_width,
        )?;
        Ok(())
    }

    /// Copies the device weights into every demon's snapshot.
    pub fn save_weights(&mut self) -> Result<()> {
        let [theta, w, trace] = WeightKind::ALL.map(|kind| self.read_per_demon(kind));
        let (theta, w, trace) = (theta?, w?, trace?);

        let snapshots = theta.into_iter().zip(w).zip(trace);
        for (demon, ((theta, w), trace)) in self.demons.iter_mut().zip(snapshots) {
            demon.restore_weights(DemonWeights {
                theta: Some(theta),
                w: Some(w),
                trace: Some(trace),
            });
        }
        Ok(())
    }

    /// Overlays every demon's stored snapshot onto the device weights.
    ///
    /// Absent vectors keep their current device values. The prediction buffer no
    /// longer matches the weights afterwards, so the next prediction is recomputed.
    pub fn upload_weights(&mut self) -> Result<()> {
        let ready = self.ready.as_ref().ok_or(HordeError::Uninitialized)?;
        let after: Vec<B::Event> = self.pending.iter().cloned().collect();

        for kind in WeightKind::ALL {
            let per_demon: Vec<Option<&[f32]>> = self
                .demons
                .iter()
                .map(|demon| {
                    let weights = demon.snapshot_weights();
                    match kind {
                        WeightKind::Theta => weights.theta.as_deref(),
                        WeightKind::W => weights.w.as_deref(),
                        WeightKind::Trace => weights.trace.as_deref(),
                    }
                })
                .collect();

            if per_demon.iter().all(Option::is_none) {
                continue;
            }
            if let Some(len) = per_demon
                .iter()
                .flatten()
                .map(|v| v.len())
                .find(|&len| len != self.feature_dim)
            {
                return Err(HordeError::FeatureDimension {
                    expected: self.feature_dim,
                    got: len,
                });
            }

            debug!(
                device = self.device.info().name.as_str();
                "uploading {} snapshot(s)",
                kind.name()
            );

            let buffer = ready.buffers.weights(kind);
            let mut device = vec![0.; ready.layout.buffer_len()];
            self.device.read(buffer, &mut device, &after)?;
            layout::to_device_layout(ready.layout, &per_demon, &mut device);

            let write = self.device.write(buffer, &device, &after)?;
            self.device.wait(&write)?;
        }

        self.last = None;
        Ok(())
    }

    /// Reads one weight array, demon-major and without padding.
    ///
    /// # Returns
    /// `local_count() * feature_dim` floats, demon after demon.
    pub fn weights(&self, kind: WeightKind) -> Result<Vec<f32>> {
        Ok(self.read_per_demon(kind)?.concat())
    }

    /// Scans the step scalars and the feature buffers for NaN.
    ///
    /// # Returns
    /// `NanDetected` naming the first corrupted array.
    pub fn check_for_nan(&self) -> Result<()> {
        let ready = self.ready.as_ref().ok_or(HordeError::Uninitialized)?;
        let local = self.demons.len();
        let nan = |array| HordeError::NanDetected {
            device: self.device.info().name.clone(),
            array,
        };

        for (array, values) in [
            ("reward", &self.arrays.reward),
            ("gamma", &self.arrays.gamma),
            ("rho", &self.arrays.rho),
        ] {
            if values[..local].iter().any(|v| v.is_nan()) {
                return Err(nan(array));
            }
        }

        let after: Vec<B::Event> = self.pending.iter().cloned().collect();
        let mut features = vec![0.; self.feature_dim];
        for (array, buffer) in [
            ("previous features", &ready.buffers.prev_features),
            ("next features", &ready.buffers.next_features),
        ] {
            self.device.read(buffer, &mut features, &after)?;
            if features.iter().any(|v| v.is_nan()) {
                return Err(nan(array));
            }
        }

        Ok(())
    }

    /// The worker's pipeline state.
    pub fn state(&self) -> WorkerState {
        match (&self.ready, &self.pending) {
            (None, _) => WorkerState::Uninitialized,
            (Some(_), None) => WorkerState::Idle,
            (Some(_), Some(_)) => WorkerState::UpdatePending,
        }
    }

    /// The device's position in the partition.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The owned device.
    pub fn device(&self) -> &B {
        &self.device
    }

    /// The demons of this device, in local order.
    pub fn demons(&self) -> &[Demon<A>] {
        &self.demons
    }

    /// Mutable access to the demons, e.g. to restore weight snapshots.
    pub fn demons_mut(&mut self) -> &mut [Demon<A>] {
        &mut self.demons
    }

    /// The real demon count.
    pub fn local_count(&self) -> usize {
        self.demons.len()
    }

    /// The padded demon count, once initialized.
    pub fn padded_count(&self) -> Option<usize> {
        self.ready.as_ref().map(|ready| ready.layout.padded)
    }

    /// Demons per work-item, once initialized.
    pub fn vector_width(&self) -> Option<usize> {
        self.ready.as_ref().map(|ready| ready.program.vector_width)
    }

    /// The work-group size actually used, once initialized.
    pub fn work_group_size(&self) -> Option<usize> {
        self.ready.as_ref().map(|ready| ready.work_group_size)
    }

    /// The hyperparameters of the current program, once initialized.
    pub fn hyperparams(&self) -> Option<Hyperparams> {
        self.ready.as_ref().map(|ready| ready.program.hyperparams)
    }

    /// Makes `event` the pending update and waits for the one it replaces.
    fn defer(&mut self, event: B::Event) -> Result<()> {
        if let Some(previous) = self.pending.replace(event) {
            self.device.wait(&previous)?;
        }
        Ok(())
    }

    fn read_per_demon(&self, kind: WeightKind) -> Result<Vec<Vec<f32>>> {
        let ready = self.ready.as_ref().ok_or(HordeError::Uninitialized)?;
        let after: Vec<B::Event> = self.pending.iter().cloned().collect();

        let mut device = vec![0.; ready.layout.buffer_len()];
        self.device.read(ready.buffers.weights(kind), &mut device, &after)?;
        Ok(layout::from_device_layout(ready.layout, self.demons.len(), &device))
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

fn to_f32(values: &[f64]) -> Vec<f32> {
    values.iter().map(|&v| v as f32).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        compute::HostDevice,
        demon::{ConstantGamma, ConstantOutcome, ConstantReward, UniformPolicy},
    };

    const F: usize = 3;

    fn source() -> KernelSource {
        KernelSource::load(concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/horde.cl")).unwrap()
    }

    fn demons(n: usize, gamma: f64) -> Vec<Demon<usize>> {
        let policy = Arc::new(UniformPolicy::new(2));
        (0..n)
            .map(|_| {
                Demon::new(
                    policy.clone(),
                    policy.clone(),
                    Arc::new(ConstantReward(0.1)),
                    Arc::new(ConstantGamma(gamma)),
                    Arc::new(ConstantOutcome(0.)),
                )
            })
            .collect()
    }

    fn worker(n: usize) -> DeviceWorker<HostDevice, usize> {
        let mut worker = DeviceWorker::new(0, HostDevice::with_memory("host", 1 << 24, 1 << 22));
        worker
            .initialize(demons(n, 0.9), F, &HordeConfig::default(), &source())
            .unwrap();
        worker
    }

    fn step<'a>(prev: Option<&'a [f64]>, next: &'a [f64]) -> Step<'a, usize> {
        Step {
            observation: None,
            prev,
            action: &0,
            next,
        }
    }

    #[test]
    fn operations_before_initialize_fail() {
        let mut worker: DeviceWorker<_, usize> =
            DeviceWorker::new(0, HostDevice::with_memory("host", 1 << 20, 1 << 20));

        assert_eq!(worker.state(), WorkerState::Uninitialized);
        assert!(matches!(
            worker.set_params(Hyperparams::default()),
            Err(HordeError::Uninitialized)
        ));
        assert!(matches!(worker.predictions(None), Err(HordeError::Uninitialized)));
    }

    #[test]
    fn initialize_pads_and_binds() {
        let worker = worker(5);

        assert_eq!(worker.vector_width(), Some(4));
        assert_eq!(worker.padded_count(), Some(256));
        assert_eq!(worker.state(), WorkerState::Idle);
        let slots: Vec<_> = worker.demons().iter().map(|d| d.slot_id()).collect();
        assert_eq!(slots, (0..5).map(Some).collect::<Vec<_>>());
    }

    #[test]
    fn work_group_is_clamped_to_device_maximum() {
        let mut info = HostDevice::with_memory("small", 1 << 20, 1 << 20).info().clone();
        info.max_work_group_size = 16;
        info.preferred_vector_width = 3;

        let mut worker = DeviceWorker::new(0, HostDevice::new(info));
        worker
            .initialize(demons(20, 0.9), F, &HordeConfig::default(), &source())
            .unwrap();

        assert_eq!(worker.work_group_size(), Some(16));
        assert_eq!(worker.vector_width(), Some(1));
        assert_eq!(worker.padded_count(), Some(32));

        // The scalar entry points learn the same step as the vectorized ones.
        worker.update(&step(Some(&[1., 0., 0.]), &[0., 1., 0.])).unwrap();
        assert_eq!(worker.predictions(Some(&[0., 1., 0.])).unwrap(), vec![0.; 20]);
        for p in worker.predictions(Some(&[1., 0., 0.])).unwrap() {
            assert!((p - 0.01).abs() < 1e-6);
        }

        let stats = worker.device().stats();
        assert_eq!(stats.dispatches("updateGTDLambda"), 1);
        assert_eq!(stats.dispatches("predict"), 2);
        assert_eq!(stats.dispatches("vec_updateGTDLambda"), 0);
        assert_eq!(stats.dispatches("vec_predict"), 0);
    }

    #[test]
    fn every_tick_issues_five_transfers_and_one_launch() {
        let mut worker = worker(2);
        let stats = worker.device().stats();
        let (writes, reads, launches) = (stats.writes(), stats.reads(), stats.total_dispatches());

        worker.update(&step(Some(&[1., 0., 0.]), &[0., 1., 0.])).unwrap();
        assert_eq!(stats.writes(), writes + 5);
        assert_eq!(stats.total_dispatches(), launches + 1);

        worker.update(&step(None, &[0., 0., 1.])).unwrap();
        assert_eq!(stats.writes(), writes + 5);
        assert_eq!(stats.total_dispatches(), launches + 2);

        worker.predictions(Some(&[0., 0., 1.])).unwrap();
        worker.predictions(None).unwrap();
        assert_eq!(stats.writes(), writes + 6);
        assert_eq!(stats.reads(), reads + 2);
        assert_eq!(stats.total_dispatches(), launches + 3);
    }

    #[test]
    fn step_scalars_land_in_each_demons_slot() {
        let mut worker = DeviceWorker::new(0, HostDevice::with_memory("host", 1 << 20, 1 << 20));
        worker
            .initialize(demons(3, 0.5), F, &HordeConfig::default(), &source())
            .unwrap();
        worker.update(&step(Some(&[1., 0., 0.]), &[0., 1., 0.])).unwrap();

        // Cumulant is reward + (1 - gamma) * outcome with a zero outcome.
        assert_eq!(worker.arrays.reward[..3], [0.1; 3]);
        assert_eq!(worker.arrays.gamma[..3], [0.5; 3]);
        assert_eq!(worker.arrays.rho[..3], [1.; 3]);
        assert!(worker.arrays.rho[3..].iter().all(|&rho| rho == 0.));
    }

    #[test]
    fn first_tick_only_resets_traces() {
        let mut worker = worker(2);
        worker.update(&step(Some(&[1., 0., 0.]), &[0., 1., 0.])).unwrap();
        let theta = worker.weights(WeightKind::Theta).unwrap();
        let w = worker.weights(WeightKind::W).unwrap();

        worker.update(&step(None, &[0., 0., 1.])).unwrap();

        assert_eq!(worker.weights(WeightKind::Trace).unwrap(), vec![0.; 2 * F]);
        assert_eq!(worker.weights(WeightKind::Theta).unwrap(), theta);
        assert_eq!(worker.weights(WeightKind::W).unwrap(), w);
        assert_eq!(worker.device().stats().dispatches("traceReset"), 1);
    }

    #[test]
    fn waits_are_deferred_one_tick() {
        let mut worker = worker(1);
        let stats = worker.device().stats();

        worker.update(&step(None, &[1., 0., 0.])).unwrap();
        assert_eq!(worker.state(), WorkerState::UpdatePending);
        let before = stats.waited().len();

        worker.update(&step(Some(&[1., 0., 0.]), &[0., 1., 0.])).unwrap();
        worker.update(&step(Some(&[0., 1., 0.]), &[0., 0., 1.])).unwrap();

        let waited = &stats.waited()[before..];
        assert_eq!(waited.len(), 2);
        assert!(waited[0] < waited[1]);
        assert_eq!(worker.state(), WorkerState::UpdatePending);
    }

    #[test]
    fn predictions_are_cached_by_features() {
        let mut worker = worker(3);
        let stats = worker.device().stats();
        let x = [0., 1., 0.];

        let first = worker.predictions(Some(&x)).unwrap();
        let second = worker.predictions(Some(&x)).unwrap();
        assert_eq!(stats.dispatches("vec_predict"), 1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        worker.predictions(Some(&[1., 0., 0.])).unwrap();
        worker.predictions(None).unwrap();
        assert_eq!(stats.dispatches("vec_predict"), 2);
    }

    #[test]
    fn update_prediction_matches_fresh_predict() {
        let mut worker = worker(4);
        let x = [0., 0., 1.];
        worker.update(&step(Some(&x), &[1., 0., 0.])).unwrap();

        let cached = worker.predictions(Some(&x)).unwrap();
        assert_eq!(worker.device().stats().dispatches("vec_predict"), 0);
        for p in &cached {
            assert!((p - 0.01).abs() < 1e-6);
        }
    }

    #[test]
    fn set_params_recompiles() {
        let mut worker = worker(1);
        let stats = worker.device().stats();
        let built = stats.programs_built();

        worker.set_params(Hyperparams::new(0.5, 0.1, 0.)).unwrap();

        assert_eq!(stats.programs_built(), built + 1);
        assert_eq!(worker.hyperparams(), Some(Hyperparams::new(0.5, 0.1, 0.)));
    }

    #[test]
    fn wrong_feature_length_is_rejected() {
        let mut worker = worker(1);
        let err = worker.update(&step(Some(&[1.]), &[0., 1., 0.])).unwrap_err();
        assert!(matches!(err, HordeError::FeatureDimension { expected: 3, got: 1 }));
    }

    #[test]
    fn nan_gamma_is_reported() {
        let mut worker = DeviceWorker::new(0, HostDevice::with_memory("host", 1 << 20, 1 << 20));
        worker
            .initialize(demons(2, f64::NAN), F, &HordeConfig::default(), &source())
            .unwrap();
        worker.check_for_nan().unwrap();

        worker.update(&step(Some(&[1., 0., 0.]), &[0., 1., 0.])).unwrap();
        match worker.check_for_nan() {
            Err(HordeError::NanDetected { array, .. }) => assert_eq!(array, "reward"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
