use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Long,
    Short,
}

/// A closed simulated trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub position: Position,
    pub size: f64,
    pub profit: f64,
    /// Predicted move relative to the reference price
    pub price_change: f64,
}

/// Trade-level performance ratios.
pub struct FinancialMetrics;

impl FinancialMetrics {
    /// Wins over losses. Infinite when there are no losing trades.
    pub fn win_loss_ratio(trades: &[TradeRecord]) -> f64 {
        let wins = trades.iter().filter(|t| t.profit > 0.0).count();
        let losses = trades.iter().filter(|t| t.profit < 0.0).count();
        if losses == 0 {
            return f64::INFINITY;
        }
        wins as f64 / losses as f64
    }

    pub fn batting_average(trades: &[TradeRecord]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }
        let wins = trades.iter().filter(|t| t.profit > 0.0).count();
        wins as f64 / trades.len() as f64
    }

    pub fn average_profit_per_trade(trades: &[TradeRecord]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }
        trades.iter().map(|t| t.profit).sum::<f64>() / trades.len() as f64
    }

    /// Compound annual return. Spans shorter than a day fall back to the total return.
    pub fn annual_return(trades: &[TradeRecord], initial_balance: f64, years: f64) -> f64 {
        if initial_balance <= 0.0 {
            return 0.0;
        }
        let final_balance = initial_balance + trades.iter().map(|t| t.profit).sum::<f64>();
        let growth = final_balance / initial_balance;
        if years < 1.0 / 365.0 || growth <= 0.0 {
            return growth - 1.0;
        }
        growth.powf(1.0 / years) - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(profit: f64) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            position: Position::Long,
            size: 1000.0,
            profit,
            price_change: profit / 1000.0,
        }
    }

    #[test]
    fn test_ratios() {
        let trades = vec![trade(100.0), trade(-50.0), trade(30.0)];
        assert!((FinancialMetrics::win_loss_ratio(&trades) - 2.0).abs() < 1e-12);
        assert!((FinancialMetrics::batting_average(&trades) - 2.0 / 3.0).abs() < 1e-12);
        assert!((FinancialMetrics::average_profit_per_trade(&trades) - 80.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_losses_is_infinite() {
        assert!(FinancialMetrics::win_loss_ratio(&[trade(1.0)]).is_infinite());
    }

    #[test]
    fn test_annual_return_compounds() {
        let trades = vec![trade(2100.0)];
        // 10_000 -> 12_100 over two years is 10% a year.
        let annual = FinancialMetrics::annual_return(&trades, 10_000.0, 2.0);
        assert!((annual - 0.1).abs() < 1e-9);
        let same_day = FinancialMetrics::annual_return(&trades, 10_000.0, 0.0);
        assert!((same_day - 0.21).abs() < 1e-9);
    }
}
