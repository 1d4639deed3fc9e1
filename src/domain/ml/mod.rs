// GAF encoding, sequence samples and model configuration
pub mod dataset;
pub mod gaf;
pub mod model_config;
pub mod model_metrics;
pub mod sample;
