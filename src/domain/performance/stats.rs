use statrs::statistics::Statistics;

/// Trading days used to annualise daily statistics.
pub const TRADING_DAYS: f64 = 252.0;

/// Shared statistics utilities for financial calculations.
pub struct Stats;

impl Stats {
    /// Sharpe ratio of daily `returns` with a zero risk-free rate.
    ///
    /// Uses the sample std (n-1). Returns 0 for fewer than two returns or a flat series.
    pub fn sharpe_ratio(returns: &[f64], annualize: bool) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if std_dev.is_nan() || std_dev <= 1e-12 {
            return 0.0;
        }
        let ratio = mean / std_dev;
        if annualize {
            ratio * TRADING_DAYS.sqrt()
        } else {
            ratio
        }
    }

    pub fn calculate_returns(prices: &[f64]) -> Vec<f64> {
        prices
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect()
    }

    /// `price / rolling_max(window) - 1` for every point; the first `window - 1`
    /// points use the expanding maximum.
    pub fn rolling_drawdowns(prices: &[f64], window: usize) -> Vec<f64> {
        let window = window.max(1);
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let start = (i + 1).saturating_sub(window);
                let peak = prices[start..=i].iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if peak > 0.0 { p / peak - 1.0 } else { 0.0 }
            })
            .collect()
    }
}
