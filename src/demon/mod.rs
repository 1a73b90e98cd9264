mod functions;
mod record;

pub use functions::{
    ConstantGamma, ConstantOutcome, ConstantReward, GammaFunction, HordeUpdatable,
    ObservationReward, OutcomeFunction, Policy, RewardFunction, Step, UniformPolicy,
};
pub use record::{Demon, DemonWeights, StepArrays, StepScalars};
