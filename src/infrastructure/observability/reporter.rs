//! Push-based metrics reporter for GAF-WGAN runs
//!
//! Emits a structured JSON snapshot on stdout and can write the Prometheus text
//! exposition to a file for a node-exporter textfile collector.
//!
//! **Security**: This system only SENDS data, never accepts requests.

use crate::application::ml::ensemble::GafWganEnsemble;
use crate::application::ml::trainer::TrainingReport;
use crate::infrastructure::observability::metrics::Metrics;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Metrics snapshot for JSON output
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub ensemble: EnsembleSnapshot,
    pub models: Vec<ModelSnapshotLine>,
}

#[derive(Debug, Serialize)]
pub struct EnsembleSnapshot {
    pub phase: String,
    pub n_models: usize,
    pub rmse: Option<f64>,
    pub hit_rate: Option<f64>,
    pub disagreement: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ModelSnapshotLine {
    pub model: usize,
    pub epochs: usize,
    pub d_loss: Option<f64>,
    pub g_loss: Option<f64>,
    pub val_mse: Option<f64>,
}

/// One-shot reporter; call [`MetricsReporter::report`] at the end of a run or phase.
pub struct MetricsReporter {
    metrics: Metrics,
    start_time: Instant,
}

impl MetricsReporter {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            start_time: Instant::now(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn collect_snapshot(&self, ensemble: &GafWganEnsemble, reports: &[TrainingReport]) -> MetricsSnapshot {
        let latest = ensemble.latest_metrics();
        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ensemble: EnsembleSnapshot {
                phase: ensemble.phase().to_string(),
                n_models: ensemble.models().len(),
                rmse: latest.map(|m| m.rmse),
                hit_rate: latest.map(|m| m.hit_rate),
                disagreement: latest.and_then(|m| m.ensemble_disagreement),
            },
            models: reports
                .iter()
                .map(|r| ModelSnapshotLine {
                    model: r.model_index,
                    epochs: r.epochs.len(),
                    d_loss: r.last().map(|e| e.d_loss),
                    g_loss: r.last().map(|e| e.g_loss),
                    val_mse: r.last().and_then(|e| e.val_mse),
                })
                .collect(),
        }
    }

    /// Prints the snapshot as a `METRICS_JSON:` line.
    pub fn report(&self, ensemble: &GafWganEnsemble, reports: &[TrainingReport]) {
        let snapshot = self.collect_snapshot(ensemble, reports);
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                // Use a special prefix so logs can be easily filtered
                println!("METRICS_JSON:{}", json);
                info!(
                    "Ensemble {} | models: {} | rmse: {:?} | uptime: {}s",
                    snapshot.ensemble.phase,
                    snapshot.ensemble.n_models,
                    snapshot.ensemble.rmse,
                    snapshot.uptime_seconds
                );
            }
            Err(e) => warn!("Failed to serialize metrics: {}", e),
        }
    }

    /// Writes the Prometheus exposition to `path` (temp file then rename).
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, self.metrics.render())
            .with_context(|| format!("Failed to write metrics to {:?}", temp_path))?;
        fs::rename(&temp_path, path).with_context(|| format!("Failed to move metrics to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ml::trainer::EpochReport;
    use crate::domain::ml::model_config::{DiscriminatorConfig, EnsembleConfig, GeneratorConfig};
    use crate::domain::ml::sample::BatchShape;

    fn ensemble() -> GafWganEnsemble {
        let config = EnsembleConfig {
            n_models: 1,
            window_size: 5,
            sequence_length: 1,
            generator: GeneratorConfig {
                hidden_channels: 1,
                kernel_size: 3,
                dense_units: vec![2],
                latent_dim: 1,
            },
            discriminator: DiscriminatorConfig {
                sequence_len: 3,
                channels: 2,
                hidden_units: 2,
                ..DiscriminatorConfig::default()
            },
            ..EnsembleConfig::default()
        };
        let shape = BatchShape {
            seq_len: 1,
            frame_size: 5,
            history_len: 2,
        };
        GafWganEnsemble::new(config, shape).unwrap()
    }

    #[test]
    fn test_snapshot_collection() {
        let reporter = MetricsReporter::new(Metrics::new().expect("Failed to create metrics"));
        let reports = vec![TrainingReport {
            model_index: 0,
            epochs: vec![EpochReport {
                epoch: 0,
                d_loss: -0.5,
                g_loss: 0.1,
                gradient_penalty: 0.2,
                val_mse: Some(0.3),
                batches: 4,
            }],
        }];
        let snapshot = reporter.collect_snapshot(&ensemble(), &reports);
        assert_eq!(snapshot.ensemble.phase, "untrained");
        assert_eq!(snapshot.models[0].val_mse, Some(0.3));
        assert!(!snapshot.timestamp.is_empty());

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"n_models\":1"));
    }

    #[test]
    fn test_write_textfile() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = MetricsReporter::new(Metrics::new().expect("Failed to create metrics"));
        reporter.metrics().meta_loss.set(0.25);
        let path = dir.path().join("gafwgan.prom");
        reporter.write_textfile(&path).unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("gafwgan_meta_loss 0.25"));
    }
}
