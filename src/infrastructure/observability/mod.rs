//! Push-based observability for GAF-WGAN
//!
//! This module provides observability through **outbound data only** - no HTTP server,
//! no incoming requests. Metrics are pushed via:
//!
//! 1. **Structured JSON Logs**: `METRICS_JSON:` lines on stdout (for Loki, Fluentd, CloudWatch)
//! 2. **Prometheus textfile** (optional): For a node-exporter textfile collector
//!
//! **Security**: This system only SENDS data, it never accepts requests.

pub mod metrics;
pub mod reporter;

pub use metrics::Metrics;
pub use reporter::MetricsReporter;
