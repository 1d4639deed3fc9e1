use crate::domain::performance::financial_metrics::{FinancialMetrics, Position, TradeRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Minimum predicted relative move before a trade is opened.
pub const TRADE_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingPerformance {
    pub win_loss_ratio: f64,
    pub batting_average: f64,
    pub avg_profit_per_trade: f64,
    pub annual_return: f64,
    pub total_trades: usize,
    pub final_balance: f64,
}

/// Backtest trader that goes all-in long or short on large predicted moves.
#[derive(Debug, Clone)]
pub struct DayTrader {
    initial_balance: f64,
    balance: f64,
    threshold: f64,
    trades: Vec<TradeRecord>,
}

impl Default for DayTrader {
    fn default() -> Self {
        Self::new(10_000.0)
    }
}

impl DayTrader {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            threshold: TRADE_THRESHOLD,
            trades: Vec::new(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    fn signal(&self, prediction: f64, reference: f64) -> Option<(Position, f64)> {
        if reference <= 0.0 || !prediction.is_finite() {
            return None;
        }
        let change = (prediction - reference) / reference;
        if change.abs() <= self.threshold {
            return None;
        }
        let position = if change > 0.0 { Position::Long } else { Position::Short };
        Some((position, change))
    }

    fn record(&mut self, trade: TradeRecord) -> Option<&TradeRecord> {
        debug!(
            "DayTrader: {:?} {:.2} -> profit {:.2}",
            trade.position, trade.size, trade.profit
        );
        self.balance += trade.profit;
        self.trades.push(trade);
        self.trades.last()
    }

    /// Trades on `prediction` against `actual`, booking the predicted move as profit.
    ///
    /// This scores signal strength only: every trade it opens is profitable.
    pub fn execute_trade(
        &mut self,
        prediction: f64,
        actual: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<&TradeRecord> {
        let (position, price_change) = self.signal(prediction, actual)?;
        let size = self.balance;
        let profit = match position {
            Position::Long => size * price_change,
            Position::Short => -size * price_change,
        };
        self.record(TradeRecord {
            timestamp,
            position,
            size,
            profit,
            price_change,
        })
    }

    /// Opens on the move predicted from `entry` and settles at the realised `exit`.
    pub fn execute_trade_realized(
        &mut self,
        prediction: f64,
        entry: f64,
        exit: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<&TradeRecord> {
        let (position, price_change) = self.signal(prediction, entry)?;
        let size = self.balance;
        let realised = (exit - entry) / entry;
        let profit = match position {
            Position::Long => size * realised,
            Position::Short => -size * realised,
        };
        self.record(TradeRecord {
            timestamp,
            position,
            size,
            profit,
            price_change,
        })
    }

    /// Zeroed metrics (and the current balance) when no trade was made.
    pub fn performance_metrics(&self) -> TradingPerformance {
        let (Some(first), Some(last)) = (self.trades.first(), self.trades.last()) else {
            return TradingPerformance {
                final_balance: self.balance,
                ..TradingPerformance::default()
            };
        };
        let years = (last.timestamp - first.timestamp).num_days() as f64 / 365.0;

        TradingPerformance {
            win_loss_ratio: FinancialMetrics::win_loss_ratio(&self.trades),
            batting_average: FinancialMetrics::batting_average(&self.trades),
            avg_profit_per_trade: FinancialMetrics::average_profit_per_trade(&self.trades),
            annual_return: FinancialMetrics::annual_return(&self.trades, self.initial_balance, years),
            total_trades: self.trades.len(),
            final_balance: self.balance,
        }
    }
}
