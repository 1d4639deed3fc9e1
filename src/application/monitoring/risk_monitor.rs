use crate::domain::performance::stats::{Stats, TRADING_DAYS};
use crate::domain::risk::alert::{AlertType, RiskAlert, RiskMetrics, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use tracing::{debug, warn};

/// Alert thresholds for the rolling risk monitor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Annualised volatility above which HIGH_VOLATILITY fires
    pub volatility: f64,
    /// Drawdown below which SEVERE_DRAWDOWN fires (negative)
    pub drawdown: f64,
    /// Annualised 95% VaR below which VAR_BREACH fires (negative)
    pub var: f64,
    /// Rolling window for the drawdown peak; also the minimum history
    pub window_size: usize,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            volatility: 0.02,
            drawdown: -0.1,
            var: -0.05,
            window_size: 20,
        }
    }
}

/// Accumulates price ticks and raises alerts when risk limits are crossed.
#[derive(Debug, Clone, Default)]
pub struct RiskMonitor {
    thresholds: RiskThresholds,
    history: Vec<(DateTime<Utc>, f64)>,
    alerts: Vec<RiskAlert>,
}

impl RiskMonitor {
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self {
            thresholds,
            history: Vec::new(),
            alerts: Vec::new(),
        }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    pub fn alerts(&self) -> &[RiskAlert] {
        &self.alerts
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Risk metrics over `prices`, or `None` with fewer than `window_size` points.
    pub fn calculate_risk_metrics(&self, prices: &[f64]) -> Option<RiskMetrics> {
        if prices.len() < self.thresholds.window_size.max(3) {
            return None;
        }
        let returns = Stats::calculate_returns(prices);
        if returns.len() < 2 {
            return None;
        }
        let annualize = TRADING_DAYS.sqrt();

        let volatility = returns.iter().std_dev() * annualize;
        let drawdown = Stats::rolling_drawdowns(prices, self.thresholds.window_size)
            .last()
            .copied()
            .unwrap_or(0.0);
        let var_95 = Data::new(returns.clone()).percentile(5) * annualize;
        let current_return = returns.last().copied().unwrap_or(0.0);

        Some(RiskMetrics {
            volatility,
            drawdown,
            var_95,
            current_return,
        })
    }

    pub fn check_conditions(&self, metrics: &RiskMetrics, timestamp: DateTime<Utc>) -> Vec<RiskAlert> {
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        if metrics.volatility > t.volatility {
            alerts.push(RiskAlert::new(
                timestamp,
                AlertType::HighVolatility,
                Severity::Warning,
                format!(
                    "Volatility ({:.2}%) above threshold ({:.2}%)",
                    metrics.volatility * 100.0,
                    t.volatility * 100.0
                ),
                *metrics,
            ));
        }
        if metrics.drawdown < t.drawdown {
            alerts.push(RiskAlert::new(
                timestamp,
                AlertType::SevereDrawdown,
                Severity::Critical,
                format!(
                    "Drawdown ({:.2}%) below threshold ({:.2}%)",
                    metrics.drawdown * 100.0,
                    t.drawdown * 100.0
                ),
                *metrics,
            ));
        }
        if metrics.var_95 < t.var {
            alerts.push(RiskAlert::new(
                timestamp,
                AlertType::VarBreach,
                Severity::Warning,
                format!(
                    "VaR ({:.2}%) below threshold ({:.2}%)",
                    metrics.var_95 * 100.0,
                    t.var * 100.0
                ),
                *metrics,
            ));
        }
        alerts
    }

    /// Records one price and returns the alerts it triggered.
    pub fn monitor_tick(&mut self, price: f64, timestamp: DateTime<Utc>) -> Vec<RiskAlert> {
        if !price.is_finite() {
            warn!("RiskMonitor: ignoring non-finite price {} at {}", price, timestamp);
            return Vec::new();
        }
        self.history.push((timestamp, price));

        let prices: Vec<f64> = self.history.iter().map(|(_, p)| *p).collect();
        let Some(metrics) = self.calculate_risk_metrics(&prices) else {
            return Vec::new();
        };
        debug!(
            volatility = metrics.volatility,
            drawdown = metrics.drawdown,
            var_95 = metrics.var_95,
            "Risk metrics updated"
        );

        let alerts = self.check_conditions(&metrics, timestamp);
        self.alerts.extend(alerts.iter().cloned());
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_no_metrics_before_window_fills() {
        let mut monitor = RiskMonitor::default();
        for i in 0..19 {
            assert!(monitor.monitor_tick(100.0, start() + Duration::days(i)).is_empty());
        }
        assert_eq!(monitor.history_len(), 19);
        assert!(monitor.alerts().is_empty());
    }

    #[test]
    fn test_flat_market_raises_nothing() {
        let monitor = RiskMonitor::default();
        let metrics = monitor.calculate_risk_metrics(&[100.0; 25]).unwrap();
        assert_eq!(metrics.volatility, 0.0);
        assert_eq!(metrics.drawdown, 0.0);
        assert!(monitor.check_conditions(&metrics, start()).is_empty());
    }

    #[test]
    fn test_crash_raises_drawdown_and_volatility() {
        let mut monitor = RiskMonitor::default();
        let mut raised = Vec::new();
        let prices: Vec<f64> = (0..20)
            .map(|i| 100.0 + i as f64 * 0.1)
            .chain((1..=6).map(|i| 102.0 * (1.0 - 0.04 * i as f64)))
            .collect();
        for (i, price) in prices.into_iter().enumerate() {
            raised.extend(monitor.monitor_tick(price, start() + Duration::days(i as i64)));
        }
        assert!(raised.iter().any(|a| a.alert_type == AlertType::SevereDrawdown
            && a.severity == Severity::Critical));
        assert!(raised.iter().any(|a| a.alert_type == AlertType::HighVolatility));
        assert!(raised.iter().any(|a| a.alert_type == AlertType::VarBreach));
        assert_eq!(monitor.alerts().len(), raised.len());
    }

    #[test]
    fn test_non_finite_tick_is_ignored() {
        let mut monitor = RiskMonitor::default();
        monitor.monitor_tick(f64::NAN, start());
        assert_eq!(monitor.history_len(), 0);
    }
}
