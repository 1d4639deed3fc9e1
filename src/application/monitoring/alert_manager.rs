use crate::domain::ports::AlertHandler;
use crate::domain::risk::alert::{AlertType, RiskAlert, Severity};
use crate::infrastructure::observability::Metrics;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

/// Fallback for severities without a registered handler: logs the alert at `warn`.
#[derive(Debug, Default)]
pub struct LogAlertHandler {
    handled: AtomicUsize,
}

impl LogAlertHandler {
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::Relaxed)
    }
}

impl AlertHandler for LogAlertHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&self, alert: &RiskAlert) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        warn!("Unhandled alert {}", alert);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total_alerts: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<AlertType, usize>,
}

/// Routes alerts to the handler registered for their severity and keeps a history.
pub struct AlertManager {
    handlers: HashMap<Severity, Arc<dyn AlertHandler>>,
    fallback: Arc<dyn AlertHandler>,
    history: Vec<RiskAlert>,
    unhandled: usize,
    metrics: Option<Metrics>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertManager {
    pub fn new() -> Self {
        Self::with_fallback(Arc::new(LogAlertHandler::default()))
    }

    pub fn with_fallback(fallback: Arc<dyn AlertHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
            history: Vec::new(),
            unhandled: 0,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers `handler` for `severity`, replacing any previous one.
    pub fn register(&mut self, severity: Severity, handler: Arc<dyn AlertHandler>) {
        info!("AlertManager: registered '{}' for {}", handler.name(), severity);
        self.handlers.insert(severity, handler);
    }

    pub fn process_alert(&mut self, alert: RiskAlert) {
        match self.handlers.get(&alert.severity) {
            Some(handler) => handler.handle(&alert),
            None => {
                self.unhandled += 1;
                self.fallback.handle(&alert);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_alert(&alert.severity.to_string(), &alert.alert_type.to_string());
        }
        self.history.push(alert);
    }

    pub fn process_all(&mut self, alerts: impl IntoIterator<Item = RiskAlert>) {
        for alert in alerts {
            self.process_alert(alert);
        }
    }

    pub fn history(&self) -> &[RiskAlert] {
        &self.history
    }

    /// Alerts that reached no registered handler.
    pub fn unhandled_count(&self) -> usize {
        self.unhandled
    }

    /// Alerts newer than `now - lookback`.
    pub fn active_alerts(&self, lookback: Duration, now: DateTime<Utc>) -> Vec<&RiskAlert> {
        let cutoff = now - lookback;
        self.history.iter().filter(|a| a.timestamp > cutoff).collect()
    }

    /// Counts over the last 24 hours before `now`.
    pub fn alert_summary(&self, now: DateTime<Utc>) -> AlertSummary {
        let active = self.active_alerts(Duration::hours(24), now);
        let mut summary = AlertSummary {
            total_alerts: active.len(),
            ..AlertSummary::default()
        };
        for alert in active {
            *summary.by_severity.entry(alert.severity).or_default() += 1;
            *summary.by_type.entry(alert.alert_type).or_default() += 1;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::risk::alert::RiskMetrics;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    impl AlertHandler for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn handle(&self, alert: &RiskAlert) {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(alert.message.clone());
            }
        }
    }

    fn alert(severity: Severity, alert_type: AlertType, at: DateTime<Utc>) -> RiskAlert {
        RiskAlert::new(at, alert_type, severity, format!("{alert_type}"), RiskMetrics::default())
    }

    #[test]
    fn test_routes_by_severity_with_fallback() {
        let critical = Arc::new(Recording::default());
        let fallback = Arc::new(LogAlertHandler::default());
        let mut manager = AlertManager::with_fallback(fallback.clone());
        manager.register(Severity::Critical, critical.clone());

        let now = Utc::now();
        manager.process_alert(alert(Severity::Critical, AlertType::SevereDrawdown, now));
        manager.process_alert(alert(Severity::Warning, AlertType::HighVolatility, now));

        assert_eq!(critical.seen.lock().unwrap().as_slice(), ["SEVERE_DRAWDOWN"]);
        assert_eq!(fallback.handled(), 1);
        assert_eq!(manager.unhandled_count(), 1);
        assert_eq!(manager.history().len(), 2);
    }

    #[test]
    fn test_active_alerts_respect_lookback() {
        let mut manager = AlertManager::new();
        let now = Utc::now();
        manager.process_alert(alert(Severity::Warning, AlertType::VarBreach, now - Duration::hours(30)));
        manager.process_alert(alert(Severity::Warning, AlertType::VarBreach, now - Duration::hours(1)));
        assert_eq!(manager.active_alerts(Duration::hours(24), now).len(), 1);
        assert_eq!(manager.active_alerts(Duration::hours(48), now).len(), 2);
    }

    #[test]
    fn test_summary_counts() {
        let mut manager = AlertManager::new();
        let now = Utc::now();
        manager.process_all([
            alert(Severity::Warning, AlertType::HighVolatility, now),
            alert(Severity::Warning, AlertType::VarBreach, now),
            alert(Severity::Critical, AlertType::SevereDrawdown, now),
        ]);
        let summary = manager.alert_summary(now);
        assert_eq!(summary.total_alerts, 3);
        assert_eq!(summary.by_severity[&Severity::Warning], 2);
        assert_eq!(summary.by_type[&AlertType::SevereDrawdown], 1);
    }
}
