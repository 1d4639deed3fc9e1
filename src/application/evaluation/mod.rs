pub mod crash_analyzer;
pub mod trader;

pub use crash_analyzer::{AdaptabilityMetrics, CrashAnalyzer, CrashMetrics, CrashPeriod, CRASH_THRESHOLD};
pub use trader::{DayTrader, TradingPerformance, TRADE_THRESHOLD};
