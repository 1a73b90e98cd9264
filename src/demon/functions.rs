use parking_lot::Mutex;

/// One environment transition, handed by value to everything that reacts to a tick.
///
/// `prev` is `None` on the first observation of an episode.
#[derive(Debug, Clone, Copy)]
pub struct Step<'a, A> {
    pub observation: Option<&'a [f64]>,
    pub prev: Option<&'a [f64]>,
    pub action: &'a A,
    pub next: &'a [f64],
}

/// Something whose value depends on the environment transition.
///
/// Functions may be shared by demons living on different devices, so the horde
/// updates each registered function exactly once per tick, before any device runs.
pub trait HordeUpdatable<A>: Send + Sync {
    /// Observes a new transition.
    ///
    /// # Arguments
    /// * `step` - The transition of the current tick.
    fn update(&self, _step: &Step<'_, A>) {}
}

/// Probability of taking an action in a given state.
pub trait Policy<A>: Send + Sync {
    /// Returns π(a | x).
    ///
    /// # Arguments
    /// * `features` - The state's feature vector.
    /// * `action` - The action taken.
    fn pi(&self, features: &[f64], action: &A) -> f64;
}

/// The per-step reward signal of a demon's question.
pub trait RewardFunction<A>: HordeUpdatable<A> {
    fn reward(&self) -> f64;
}

/// The per-step discount of a demon's question.
pub trait GammaFunction<A>: HordeUpdatable<A> {
    fn gamma(&self) -> f64;
}

/// The terminal outcome of a demon's question.
pub trait OutcomeFunction<A>: HordeUpdatable<A> {
    fn outcome(&self) -> f64;
}

/// A discount that never changes.
#[derive(Debug, Clone, Copy)]
pub struct ConstantGamma(pub f64);

impl<A> HordeUpdatable<A> for ConstantGamma {}

impl<A> GammaFunction<A> for ConstantGamma {
    fn gamma(&self) -> f64 {
        self.0
    }
}

/// An outcome that never changes.
#[derive(Debug, Clone, Copy)]
pub struct ConstantOutcome(pub f64);

impl<A> HordeUpdatable<A> for ConstantOutcome {}

impl<A> OutcomeFunction<A> for ConstantOutcome {
    fn outcome(&self) -> f64 {
        self.0
    }
}

/// A reward that never changes.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReward(pub f64);

impl<A> HordeUpdatable<A> for ConstantReward {}

impl<A> RewardFunction<A> for ConstantReward {
    fn reward(&self) -> f64 {
        self.0
    }
}

/// A reward read from one component of the raw observation.
///
/// Holds the last value seen, it only moves when the horde updates it.
#[derive(Debug)]
pub struct ObservationReward {
    index: usize,
    value: Mutex<f64>,
}

impl ObservationReward {
    /// Creates a new `ObservationReward`.
    ///
    /// # Arguments
    /// * `index` - The observation component to track.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            value: Mutex::new(0.),
        }
    }
}

impl<A> HordeUpdatable<A> for ObservationReward {
    fn update(&self, step: &Step<'_, A>) {
        let value = step
            .observation
            .and_then(|o| o.get(self.index).copied())
            .unwrap_or(0.);

        *self.value.lock() = value;
    }
}

impl<A> RewardFunction<A> for ObservationReward {
    fn reward(&self) -> f64 {
        *self.value.lock()
    }
}

/// Picks uniformly among a fixed number of actions.
#[derive(Debug, Clone, Copy)]
pub struct UniformPolicy {
    actions: usize,
}

impl UniformPolicy {
    /// Creates a new `UniformPolicy`.
    ///
    /// # Arguments
    /// * `actions` - The amount of available actions.
    pub fn new(actions: usize) -> Self {
        Self { actions }
    }
}

impl<A> Policy<A> for UniformPolicy {
    fn pi(&self, _features: &[f64], _action: &A) -> f64 {
        1. / self.actions as f64
    }
}
