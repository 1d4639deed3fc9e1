use chrono::{DateTime, Duration, TimeZone, Utc};
use gafwgan::application::evaluation::{CRASH_THRESHOLD, CrashAnalyzer, DayTrader};
use gafwgan::application::monitoring::{
    AlertManager, HealthStatus, MarketStateTracker, ModelMonitor, RiskMonitor,
};
use gafwgan::domain::market::price_series::PriceSeries;
use gafwgan::domain::performance::stats::Stats;
use gafwgan::domain::ports::AlertHandler;
use gafwgan::domain::risk::alert::{AlertType, RiskAlert, Severity};
use gafwgan::infrastructure::observability::Metrics;
use serde_json::json;
use std::sync::{Arc, Mutex};

// --- Helpers ---

#[derive(Default)]
struct CollectingHandler {
    seen: Mutex<Vec<AlertType>>,
}

impl AlertHandler for CollectingHandler {
    fn name(&self) -> &str {
        "collect"
    }

    fn handle(&self, alert: &RiskAlert) {
        self.seen.lock().unwrap().push(alert.alert_type);
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 2, 3, 0, 0, 0).unwrap()
}

/// Gentle uptrend, a 5%/day slide and a rebound past the old high.
fn market() -> Vec<f64> {
    let mut prices: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.1).collect();
    let mut p = 102.9;
    for _ in 0..10 {
        p *= 0.95;
        prices.push(p);
    }
    prices.extend((1..=20).map(|i| p + i as f64 * 3.0));
    prices
}

// --- Tests ---

#[test]
fn test_risk_alerts_are_routed_and_summarised() {
    let metrics = Metrics::new().expect("Failed to create metrics");
    let critical = Arc::new(CollectingHandler::default());
    let mut manager = AlertManager::new().with_metrics(metrics.clone());
    manager.register(Severity::Critical, critical.clone());

    let mut monitor = RiskMonitor::default();
    let prices = market();
    for (i, price) in prices.iter().enumerate() {
        let alerts = monitor.monitor_tick(*price, start() + Duration::days(i as i64));
        manager.process_all(alerts);
    }

    assert!(!manager.history().is_empty());
    let seen = critical.seen.lock().unwrap().clone();
    assert!(seen.contains(&AlertType::SevereDrawdown));
    assert!(seen.iter().all(|t| *t == AlertType::SevereDrawdown));

    // Warnings have no registered handler and go to the fallback
    let warnings = manager
        .history()
        .iter()
        .filter(|a| a.severity == Severity::Warning)
        .count();
    assert!(warnings > 0);
    assert_eq!(manager.unhandled_count(), warnings);

    let now = start() + Duration::days(prices.len() as i64);
    let summary = manager.alert_summary(now);
    let last_day = manager.active_alerts(Duration::hours(24), now).len();
    assert_eq!(summary.total_alerts, last_day);
    let everything = manager.active_alerts(Duration::days(365), now);
    assert_eq!(everything.len(), manager.history().len());

    assert!(metrics.render().contains("gafwgan_alerts_total"));
}

#[test]
fn test_crash_analysis_and_backtest() {
    let prices = market();
    let series = PriceSeries::daily(start(), &prices).unwrap();
    let analyzer = CrashAnalyzer::default();

    let periods = analyzer.identify_crash_periods(&series, CRASH_THRESHOLD);
    assert_eq!(periods.len(), 1);
    let period = &periods[0];
    assert_eq!(period.start_index, 34);
    assert!(period.end_index > 39 && period.end_index < 50);

    let mut returns = vec![0.0];
    returns.extend(Stats::calculate_returns(&prices));
    let drawdowns = Stats::rolling_drawdowns(&prices, analyzer.lookback_window());
    let crash = analyzer.crash_metrics(period, &returns, &drawdowns);
    assert_eq!(crash.duration, period.len());
    assert!(crash.max_drawdown < CRASH_THRESHOLD);
    assert!(crash.sharpe_ratio < 0.0);
    assert!(crash.recovery_time.is_some());

    // A perfect one-step forecaster trades only the big moves and never loses
    let mut trader = DayTrader::default().with_threshold(0.03);
    for i in 1..prices.len() {
        let ts = start() + Duration::days(i as i64);
        trader.execute_trade_realized(prices[i], prices[i - 1], prices[i], ts);
    }
    let performance = trader.performance_metrics();
    assert!(performance.total_trades > 0);
    assert_eq!(performance.batting_average, 1.0);
    assert!(performance.final_balance > 10_000.0);
}

#[test]
fn test_model_health_feeds_market_state() {
    let mut monitor = ModelMonitor::default();
    let mut tracker = MarketStateTracker::new();
    let now = start();

    let good = monitor
        .update_monitoring(&[0.01, -0.01, 0.02], &[0.011, -0.009, 0.018], None, now)
        .unwrap();
    assert_eq!(good.status, HealthStatus::Healthy);
    let v1 = tracker.update_state(
        "SPY",
        [
            ("rmse".to_string(), json!(good.metrics.rmse)),
            ("status".to_string(), json!(good.status)),
        ],
        now,
    );

    let per_model = vec![vec![0.5, 0.6, 0.4], vec![-2.5, -3.0, 3.0]];
    let bad = monitor
        .update_monitoring(&[0.4, 0.5, 0.45], &[-0.01, 0.0, 0.01], Some(per_model.as_slice()), now)
        .unwrap();
    assert_eq!(bad.status, HealthStatus::Warning);
    assert!(bad.needs_retraining);
    let v2 = tracker.update_state(
        "SPY",
        [("status".to_string(), json!(bad.status))],
        now + Duration::hours(1),
    );

    assert_eq!((v1, v2), (1, 2));
    let state = tracker.get_state("SPY").unwrap();
    assert_eq!(state.get_f64("rmse"), Some(good.metrics.rmse));
    assert_eq!(state.get("status"), Some(&json!(HealthStatus::Warning)));
    assert_eq!(monitor.history().len(), 2);
    assert_eq!(tracker.version("QQQ"), 0);
}
