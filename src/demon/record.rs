use std::{fmt, sync::Arc};

use super::{GammaFunction, OutcomeFunction, Policy, RewardFunction};

/// The three scalars a demon feeds its learner on every step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepScalars {
    pub reward: f32,
    pub gamma: f32,
    pub rho: f32,
}

/// Host staging arrays shared by every demon of a device, indexed by slot.
///
/// Each array is uploaded to the device as a whole, so they're kept apart to let
/// every transfer be issued as soon as its own field is computed.
#[derive(Debug, Clone, PartialEq)]
pub struct StepArrays {
    pub reward: Vec<f32>,
    pub gamma: Vec<f32>,
    pub rho: Vec<f32>,
}

impl StepArrays {
    /// Creates zeroed arrays of `len` slots.
    pub fn zeroed(len: usize) -> Self {
        Self {
            reward: vec![0.; len],
            gamma: vec![0.; len],
            rho: vec![0.; len],
        }
    }
}

/// A point-in-time copy of a demon's learned vectors, each `feature_dim` long.
///
/// A `None` vector means "no opinion": the device keeps whatever it was initialized with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemonWeights {
    pub theta: Option<Vec<f32>>,
    pub w: Option<Vec<f32>>,
    pub trace: Option<Vec<f32>>,
}

/// The host-side record of one off-policy learner.
///
/// The learner itself lives on a device, the demon only turns the shared functions
/// into its per-step scalars and remembers a snapshot of its weights.
pub struct Demon<A> {
    slot: Option<usize>,
    target: Arc<dyn Policy<A>>,
    behaviour: Arc<dyn Policy<A>>,
    reward_fn: Arc<dyn RewardFunction<A>>,
    gamma_fn: Arc<dyn GammaFunction<A>>,
    outcome_fn: Arc<dyn OutcomeFunction<A>>,
    weights: DemonWeights,
}

impl<A> Demon<A> {
    /// Creates a new unbound `Demon`.
    ///
    /// # Arguments
    /// * `target` - The policy whose value is learned.
    /// * `behaviour` - The policy actually generating the actions.
    /// * `reward_fn` - The reward of the question.
    /// * `gamma_fn` - The discount of the question.
    /// * `outcome_fn` - The outcome of the question.
    pub fn new(
        target: Arc<dyn Policy<A>>,
        behaviour: Arc<dyn Policy<A>>,
        reward_fn: Arc<dyn RewardFunction<A>>,
        gamma_fn: Arc<dyn GammaFunction<A>>,
        outcome_fn: Arc<dyn OutcomeFunction<A>>,
    ) -> Self {
        Self {
            slot: None,
            target,
            behaviour,
            reward_fn,
            gamma_fn,
            outcome_fn,
            weights: DemonWeights::default(),
        }
    }

    /// Computes this step's reward, gamma and rho.
    ///
    /// A behaviour policy giving zero probability to the taken action is a broken
    /// input and shows up as an infinite or NaN rho.
    ///
    /// # Arguments
    /// * `prev` - The features the action was taken from.
    /// * `action` - The action taken.
    /// * `next` - The features the action led to. None of the stock functions read
    ///   them, they're part of the transition every learner is handed.
    pub fn step_scalars(&self, prev: &[f64], action: &A, _next: &[f64]) -> StepScalars {
        StepScalars {
            reward: self.cumulant(),
            gamma: self.gamma(),
            rho: self.rho(prev, action),
        }
    }

    /// Writes this step's reward into the demon's slot.
    pub fn update_reward(&self, rewards: &mut [f32]) {
        rewards[self.slot()] = self.cumulant();
    }

    /// Writes this step's gamma into the demon's slot.
    pub fn update_gamma(&self, gammas: &mut [f32]) {
        gammas[self.slot()] = self.gamma();
    }

    /// Writes this step's importance sampling ratio into the demon's slot.
    ///
    /// # Arguments
    /// * `prev` - The features the action was taken from.
    /// * `action` - The action taken.
    /// * `rhos` - The device's rho staging array.
    pub fn update_rho(&self, prev: &[f64], action: &A, rhos: &mut [f32]) {
        rhos[self.slot()] = self.rho(prev, action);
    }

    /// Binds the demon to its slot on the owning device.
    pub(crate) fn bind(&mut self, slot: usize) {
        debug_assert!(self.slot.is_none(), "demon bound twice");
        self.slot = Some(slot);
    }

    /// Returns the slot assigned by the owning device, if bound.
    pub fn slot_id(&self) -> Option<usize> {
        self.slot
    }

    /// Returns the last stored weight snapshot.
    pub fn snapshot_weights(&self) -> &DemonWeights {
        &self.weights
    }

    /// Replaces the stored weight snapshot.
    ///
    /// The device only sees it on its next weight upload.
    pub fn restore_weights(&mut self, weights: DemonWeights) {
        self.weights = weights;
    }

    /// # Panics
    /// If the demon isn't bound to a device yet.
    fn slot(&self) -> usize {
        match self.slot {
            Some(slot) => slot,
            None => panic!("demon used before being bound to a device"),
        }
    }

    fn gamma(&self) -> f32 {
        self.gamma_fn.gamma() as f32
    }

    fn cumulant(&self) -> f32 {
        let gamma = self.gamma_fn.gamma();
        (self.reward_fn.reward() + (1. - gamma) * self.outcome_fn.outcome()) as f32
    }

    fn rho(&self, prev: &[f64], action: &A) -> f32 {
        (self.target.pi(prev, action) / self.behaviour.pi(prev, action)) as f32
    }
}

impl<A> fmt::Debug for Demon<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demon")
            .field("slot", &self.slot)
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}
