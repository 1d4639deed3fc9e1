use crate::domain::market::price_series::PriceSeries;
use crate::domain::performance::stats::Stats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Drawdown below which a point belongs to a crash.
pub const CRASH_THRESHOLD: f64 = -0.20;

/// A maximal run of consecutive points in crash territory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashPeriod {
    pub start_index: usize,
    /// Inclusive
    pub end_index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Deepest drawdown inside the period
    pub max_drawdown: f64,
}

impl CrashPeriod {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashMetrics {
    pub duration: usize,
    pub max_drawdown: f64,
    /// Steps from the trough until the drawdown is back to zero, if it ever is
    pub recovery_time: Option<usize>,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
}

/// How predictions changed between the run-up and the crash itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptabilityMetrics {
    /// Correlation between pre-crash and crash predictions
    pub prediction_shift: Option<f64>,
    /// `std(crash) / std(pre-crash)`
    pub uncertainty_increase: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct CrashAnalyzer {
    lookback_window: usize,
}

impl Default for CrashAnalyzer {
    fn default() -> Self {
        Self::new(20)
    }
}

impl CrashAnalyzer {
    pub fn new(lookback_window: usize) -> Self {
        Self {
            lookback_window: lookback_window.max(1),
        }
    }

    pub fn lookback_window(&self) -> usize {
        self.lookback_window
    }

    /// Drawdown against the rolling `lookback_window` maximum; `None` until the
    /// window first fills.
    pub fn drawdowns(&self, prices: &[f64]) -> Vec<Option<f64>> {
        Stats::rolling_drawdowns(prices, self.lookback_window)
            .into_iter()
            .enumerate()
            .map(|(i, dd)| (i + 1 >= self.lookback_window).then_some(dd))
            .collect()
    }

    pub fn identify_crash_periods(&self, series: &PriceSeries, threshold: f64) -> Vec<CrashPeriod> {
        let points = series.points();
        let drawdowns = self.drawdowns(&series.prices());
        let mut periods = Vec::new();
        let mut current: Option<CrashPeriod> = None;

        for (i, dd) in drawdowns.into_iter().enumerate() {
            match (dd.filter(|d| *d < threshold), current.as_mut()) {
                (Some(d), Some(period)) => {
                    period.end_index = i;
                    period.end = points[i].timestamp;
                    period.max_drawdown = period.max_drawdown.min(d);
                }
                (Some(d), None) => {
                    current = Some(CrashPeriod {
                        start_index: i,
                        end_index: i,
                        start: points[i].timestamp,
                        end: points[i].timestamp,
                        max_drawdown: d,
                    });
                }
                (None, _) => periods.extend(current.take()),
            }
        }
        periods.extend(current);
        periods
    }

    /// Metrics for `period`. `returns` and `drawdowns` are aligned with the series
    /// the period was found in; recovery is searched up to the end of `drawdowns`.
    pub fn crash_metrics(&self, period: &CrashPeriod, returns: &[f64], drawdowns: &[f64]) -> CrashMetrics {
        let end = (period.end_index + 1).min(returns.len());
        let start = period.start_index.min(end);
        let period_returns = &returns[start..end];

        let dd_end = (period.end_index + 1).min(drawdowns.len());
        let dd_start = period.start_index.min(dd_end);
        let trough = drawdowns[dd_start..dd_end]
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(offset, dd)| (dd_start + offset, *dd));

        let recovery_time = trough.and_then(|(index, _)| {
            drawdowns[index + 1..]
                .iter()
                .position(|dd| *dd >= 0.0)
                .map(|steps| steps + 1)
        });

        let win_rate = if period_returns.is_empty() {
            0.0
        } else {
            period_returns.iter().filter(|r| **r > 0.0).count() as f64 / period_returns.len() as f64
        };

        CrashMetrics {
            duration: period.len(),
            max_drawdown: trough.map_or(period.max_drawdown, |(_, dd)| dd),
            recovery_time,
            sharpe_ratio: Stats::sharpe_ratio(period_returns, true),
            win_rate,
        }
    }

    /// `std(crash) / std(pre_crash)`; `None` when either side is too short or flat.
    pub fn prediction_uncertainty_ratio(&self, pre_crash: &[f64], crash: &[f64]) -> Option<f64> {
        if pre_crash.len() < 2 || crash.len() < 2 {
            return None;
        }
        let before = pre_crash.iter().population_std_dev();
        let during = crash.iter().population_std_dev();
        (before > 0.0).then(|| during / before)
    }

    pub fn analyze_adaptability(&self, pre_crash: &[f64], crash: &[f64]) -> AdaptabilityMetrics {
        let prediction_shift = if pre_crash.len() == crash.len() && crash.len() >= 2 {
            let cov = pre_crash.iter().covariance(crash.iter());
            let denom = pre_crash.iter().std_dev() * crash.iter().std_dev();
            (denom > 0.0).then(|| cov / denom)
        } else {
            None
        };
        AdaptabilityMetrics {
            prediction_shift,
            uncertainty_increase: self.prediction_uncertainty_ratio(pre_crash, crash),
        }
    }
}
