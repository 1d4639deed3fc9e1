// Backtesting and crash analysis
pub mod evaluation;

// GAF-WGAN models, training and the ensemble
pub mod ml;

// Model health, market risk and alerting
pub mod monitoring;
