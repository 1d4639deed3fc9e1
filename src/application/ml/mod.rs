pub mod discriminator;
pub mod ensemble;
pub mod generator;
pub mod meta_learner;
pub mod trainer;
pub mod wgan;

pub use ensemble::{EnsemblePhase, EnsemblePrediction, GafWganEnsemble, MetaReport};
pub use trainer::{CancelToken, EpochReport, GafWganTrainer, TrainingReport};
pub use wgan::{GafWgan, ModelSnapshot, StepLosses};
