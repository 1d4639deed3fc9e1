// Performance tracking domain
pub mod financial_metrics;
pub mod stats;
