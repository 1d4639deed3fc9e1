//! Prometheus metrics definitions for GAF-WGAN training
//!
//! All metrics use the `gafwgan_` prefix and are push-only.

use prometheus::{
    CounterVec, Gauge, GaugeVec, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
};
use std::sync::Arc;

/// Prometheus metrics for ensemble training and monitoring
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Last epoch's mean critic loss per model
    pub discriminator_loss: GenericGaugeVec<AtomicF64>,
    /// Last epoch's mean generator loss per model
    pub generator_loss: GenericGaugeVec<AtomicF64>,
    /// Last epoch's mean gradient penalty per model
    pub gradient_penalty: GenericGaugeVec<AtomicF64>,
    /// Validation MSE (normalized frame) per model
    pub validation_mse: GenericGaugeVec<AtomicF64>,
    /// Epochs completed per model
    pub epochs_completed: GenericGaugeVec<AtomicF64>,
    /// Last meta-learner epoch loss
    pub meta_loss: GenericGauge<AtomicF64>,
    /// Ensemble RMSE in price units from the latest evaluation
    pub ensemble_rmse: GenericGauge<AtomicF64>,
    /// Ensemble disagreement from the latest evaluation
    pub ensemble_disagreement: GenericGauge<AtomicF64>,
    /// Ensemble phase (0=untrained, 1=base trained, 2=ready)
    pub ensemble_phase: GenericGauge<AtomicF64>,
    /// Divergences per model
    pub divergences_total: CounterVec,
    /// Risk alerts by severity
    pub alerts_total: CounterVec,
}

impl Metrics {
    /// Create a new Metrics instance with all gauges and counters registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let per_model = |name: &str, help: &str| -> anyhow::Result<GenericGaugeVec<AtomicF64>> {
            let gauge = GaugeVec::new(Opts::new(name, help), &["model"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let discriminator_loss = per_model(
            "gafwgan_discriminator_loss",
            "Mean discriminator loss of the last epoch",
        )?;
        let generator_loss = per_model(
            "gafwgan_generator_loss",
            "Mean generator loss of the last epoch",
        )?;
        let gradient_penalty = per_model(
            "gafwgan_gradient_penalty",
            "Mean gradient penalty of the last epoch",
        )?;
        let validation_mse = per_model(
            "gafwgan_validation_mse",
            "Generator validation MSE in the normalized frame",
        )?;
        let epochs_completed = per_model(
            "gafwgan_epochs_completed",
            "Training epochs completed",
        )?;

        let meta_loss = Gauge::with_opts(Opts::new(
            "gafwgan_meta_loss",
            "Mean meta-learner loss of the last epoch",
        ))?;
        registry.register(Box::new(meta_loss.clone()))?;

        let ensemble_rmse = Gauge::with_opts(Opts::new(
            "gafwgan_ensemble_rmse",
            "Ensemble RMSE in price units",
        ))?;
        registry.register(Box::new(ensemble_rmse.clone()))?;

        let ensemble_disagreement = Gauge::with_opts(Opts::new(
            "gafwgan_ensemble_disagreement",
            "Std across base models of their mean prediction",
        ))?;
        registry.register(Box::new(ensemble_disagreement.clone()))?;

        let ensemble_phase = Gauge::with_opts(Opts::new(
            "gafwgan_ensemble_phase",
            "Ensemble phase (0=untrained, 1=base trained, 2=ready)",
        ))?;
        registry.register(Box::new(ensemble_phase.clone()))?;

        let divergences_total = CounterVec::new(
            Opts::new("gafwgan_divergences_total", "Training divergences per model"),
            &["model", "phase"],
        )?;
        registry.register(Box::new(divergences_total.clone()))?;

        let alerts_total = CounterVec::new(
            Opts::new("gafwgan_alerts_total", "Risk alerts by severity and type"),
            &["severity", "alert_type"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            discriminator_loss,
            generator_loss,
            gradient_penalty,
            validation_mse,
            epochs_completed,
            meta_loss,
            ensemble_rmse,
            ensemble_disagreement,
            ensemble_phase,
            divergences_total,
            alerts_total,
        })
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    /// Record the summary of one training epoch
    pub fn record_epoch(
        &self,
        model: usize,
        d_loss: f64,
        g_loss: f64,
        gradient_penalty: f64,
        val_mse: Option<f64>,
    ) {
        let label = model.to_string();
        let labels = [label.as_str()];
        self.discriminator_loss.with_label_values(&labels).set(d_loss);
        self.generator_loss.with_label_values(&labels).set(g_loss);
        self.gradient_penalty
            .with_label_values(&labels)
            .set(gradient_penalty);
        if let Some(mse) = val_mse {
            self.validation_mse.with_label_values(&labels).set(mse);
        }
        self.epochs_completed.with_label_values(&labels).inc();
    }

    /// Increment the divergence counter for a model
    pub fn inc_divergence(&self, model: usize, phase: &str) {
        self.divergences_total
            .with_label_values(&[model.to_string().as_str(), phase])
            .inc();
    }

    /// Increment the alert counter
    pub fn inc_alert(&self, severity: &str, alert_type: &str) {
        self.alerts_total
            .with_label_values(&[severity, alert_type])
            .inc();
    }
}
