use thiserror::Error;

/// Errors raised while turning a price window into a Gramian Angular Field
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodingError {
    #[error("Degenerate window: all {len} prices equal {value}")]
    DegenerateWindow { len: usize, value: f64 },

    #[error("Non-finite value {value} at window index {index}")]
    NonFiniteValue { index: usize, value: f64 },

    #[error("Window length mismatch: expected {expected}, got {actual}")]
    WindowLength { expected: usize, actual: usize },

    #[error("Window range {min}..{max} overflows f64")]
    UnboundedRange { min: f64, max: f64 },
}

/// A tensor arrived with a shape the receiving component cannot accept
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
pub struct ShapeMismatch {
    pub context: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

impl ShapeMismatch {
    pub fn new(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Which optimisation step produced a loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Discriminator,
    Generator,
    GradientPenalty,
    Meta,
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrainingPhase::Discriminator => "discriminator",
            TrainingPhase::Generator => "generator",
            TrainingPhase::GradientPenalty => "gradient_penalty",
            TrainingPhase::Meta => "meta",
        };
        f.write_str(name)
    }
}

/// Errors from training a single GAF-WGAN model
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error("Training diverged: {phase} loss {value} at epoch {epoch}, iteration {iteration}")]
    Diverged {
        phase: TrainingPhase,
        epoch: usize,
        iteration: u64,
        value: f64,
    },

    #[error(transparent)]
    Shape(#[from] ShapeMismatch),

    #[error("Batch source yielded no batches")]
    EmptyDataset,

    #[error("Training cancelled at epoch {epoch}")]
    Cancelled { epoch: usize },
}

/// Errors from the ensemble coordinator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnsembleError {
    #[error("Ensemble is not ready: meta-learner has not been trained")]
    NotReady,

    #[error("Base models must be trained before the meta-learner")]
    BaseModelsNotTrained,

    #[error("{} of the base models failed to train", failures.len())]
    BaseModelsFailed { failures: Vec<(usize, TrainingError)> },

    #[error("Meta-learner data source yielded no batches")]
    EmptyDataset,

    #[error("Meta-learner diverged: loss {value} at epoch {epoch}")]
    MetaDiverged { epoch: usize, value: f64 },

    #[error(transparent)]
    Shape(#[from] ShapeMismatch),

    #[error("Invalid ensemble configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Errors when building a price series
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PriceSeriesError {
    #[error("Price series is empty")]
    Empty,

    #[error("Timestamps must be strictly increasing (index {index})")]
    NonMonotonic { index: usize },

    #[error("Non-finite price {value} at index {index}")]
    NonFinite { index: usize, value: f64 },
}

/// Errors when saving or restoring an ensemble checkpoint
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint (de)serialization failed for {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint is missing model {index}")]
    MissingModel { index: usize },

    #[error("Checkpoint model count mismatch: manifest says {expected}, config says {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Checkpoint does not describe a valid ensemble: {0}")]
    Ensemble(#[from] EnsembleError),
}
