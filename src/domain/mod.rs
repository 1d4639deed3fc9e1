// Market data domain
pub mod market;

// GAF encoding, samples and model configuration
pub mod ml;

// Performance tracking domain
pub mod performance;

// Port interfaces
pub mod ports;

// Risk alerts
pub mod risk;

// Domain-specific error types
pub mod errors;
