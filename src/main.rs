use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gafwgan::application::evaluation::{CrashAnalyzer, DayTrader};
use gafwgan::application::ml::GafWganEnsemble;
use gafwgan::application::monitoring::{
    AlertManager, LogAlertHandler, MarketStateTracker, ModelMonitor, RiskMonitor,
};
use gafwgan::config::Config;
use gafwgan::domain::market::price_series::PriceSeries;
use gafwgan::domain::ml::dataset::{GafDataset, SequenceBuilder};
use gafwgan::domain::ml::model_config::EnsembleConfig;
use gafwgan::domain::performance::stats::Stats;
use gafwgan::domain::ports::{BatchSource, PriceSource};
use gafwgan::domain::risk::alert::Severity;
use gafwgan::infrastructure::market_data::CsvPriceLoader;
use gafwgan::infrastructure::observability::{Metrics, MetricsReporter};
use gafwgan::infrastructure::persistence::CheckpointStore;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "GAF-WGAN ensemble price forecasting", long_about = None)]
struct Cli {
    /// Symbol to load from DATA_DIR (overrides SYMBOL)
    #[arg(long, global = true)]
    symbol: Option<String>,

    /// Checkpoint directory (overrides CHECKPOINT_DIR)
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train base models and the meta-learner, evaluate on the test split, save a checkpoint
    Train {
        /// Base model epochs (overrides EPOCHS)
        #[arg(long)]
        epochs: Option<usize>,

        /// Meta-learner epochs (overrides META_EPOCHS)
        #[arg(long)]
        meta_epochs: Option<usize>,
    },
    /// Evaluate a checkpoint on the test split with health, crash and risk analysis
    Eval,
    /// Day-trading backtest of a checkpoint on the test split
    Backtest,
}

/// Chronological splits of one symbol's samples.
struct PreparedData {
    series: PriceSeries,
    train: GafDataset,
    validation: GafDataset,
    test: GafDataset,
}

fn prepare_data(config: &Config, ensemble_config: &EnsembleConfig) -> Result<PreparedData> {
    let training = &config.training;
    let loader = CsvPriceLoader::new(&training.data_dir).with_price_column(training.price_column.clone());
    let series = loader
        .load(&training.symbol)
        .with_context(|| format!("Failed to load prices for {}", training.symbol))?;

    let builder = SequenceBuilder::new(
        ensemble_config.window_size,
        ensemble_config.sequence_length,
        ensemble_config.history_len(),
    )?;
    let dataset = GafDataset::from_series(&builder, &series)
        .with_batch_size(training.batch_size)
        .with_seed(ensemble_config.seed);
    if dataset.is_empty() {
        bail!(
            "{} prices are too few for window {} and sequence length {}",
            series.len(),
            ensemble_config.window_size,
            ensemble_config.sequence_length
        );
    }

    let (train, validation, test) = dataset.split(training.train_fraction, training.validation_fraction);
    if train.is_empty() || validation.is_empty() || test.is_empty() {
        bail!(
            "Split produced an empty set (train {}, validation {}, test {})",
            train.len(),
            validation.len(),
            test.len()
        );
    }
    info!(
        "Prepared {} samples: train {}, validation {}, test {}",
        train.len() + validation.len() + test.len(),
        train.len(),
        validation.len(),
        test.len()
    );
    Ok(PreparedData {
        series,
        train,
        validation,
        test,
    })
}

fn load_checkpoint(config: &Config, metrics: Option<&Metrics>) -> Result<GafWganEnsemble> {
    let store = CheckpointStore::new(&config.training.checkpoint_dir);
    let mut ensemble = store
        .load()
        .with_context(|| format!("Failed to load checkpoint from {:?}", store.dir()))?;
    if let Some(metrics) = metrics {
        ensemble = ensemble.with_metrics(metrics.clone());
    }
    Ok(ensemble)
}

fn check_shape(ensemble: &GafWganEnsemble, data: &PreparedData) -> Result<()> {
    if ensemble.shape() != data.test.shape() {
        bail!(
            "Checkpoint expects samples {:?}, data yields {:?}",
            ensemble.shape(),
            data.test.shape()
        );
    }
    Ok(())
}

fn finish(reporter: Option<&MetricsReporter>, config: &Config, ensemble: &GafWganEnsemble) -> Result<()> {
    let Some(reporter) = reporter else {
        return Ok(());
    };
    reporter.report(ensemble, &[]);
    if let Some(path) = &config.observability.textfile_path {
        reporter.write_textfile(path)?;
    }
    Ok(())
}

fn run_train(
    config: &Config,
    reporter: Option<&MetricsReporter>,
    epochs: usize,
    meta_epochs: usize,
) -> Result<()> {
    let ensemble_config = config.model.ensemble_config();
    let data = prepare_data(config, &ensemble_config)?;

    let mut ensemble = GafWganEnsemble::new(ensemble_config, data.train.shape())?;
    if let Some(reporter) = reporter {
        ensemble = ensemble.with_metrics(reporter.metrics().clone());
    }

    let reports = ensemble.train_base_models(&data.train, Some(&data.validation as &dyn BatchSource), epochs)?;
    let meta = ensemble.train_meta_learner(&data.validation, meta_epochs)?;
    info!("Meta-learner final loss: {:?}", meta.losses.last());

    let test_metrics = ensemble.evaluate(&data.test)?;
    println!("{}", serde_json::to_string_pretty(&test_metrics)?);

    CheckpointStore::new(&config.training.checkpoint_dir).save(&ensemble)?;

    if let Some(reporter) = reporter {
        reporter.report(&ensemble, &reports);
        if let Some(path) = &config.observability.textfile_path {
            reporter.write_textfile(path)?;
        }
    }
    Ok(())
}

fn run_eval(config: &Config, reporter: Option<&MetricsReporter>) -> Result<()> {
    let mut ensemble = load_checkpoint(config, reporter.map(MetricsReporter::metrics))?;
    let data = prepare_data(config, ensemble.config())?;
    check_shape(&ensemble, &data)?;

    let test_metrics = ensemble.evaluate(&data.test)?;
    let batch = data.test.full_batch().context("Test split is empty")?;
    let prediction = ensemble.predict(&batch)?;

    // Model health on relative moves from the last observed price
    let to_returns = |values: &[f64]| -> Vec<f64> {
        values
            .iter()
            .zip(&batch.anchors)
            .map(|(v, anchor)| (v - anchor) / anchor)
            .collect()
    };
    let per_model_returns: Vec<Vec<f64>> = prediction
        .per_model_prices
        .iter()
        .map(|p| to_returns(p.as_slice()))
        .collect();
    let mut monitor = ModelMonitor::new(config.monitor.monitor_thresholds());
    let health = monitor.update_monitoring(
        &to_returns(prediction.prices.as_slice()),
        &to_returns(batch.target_prices.as_slice()),
        Some(per_model_returns.as_slice()),
        Utc::now(),
    )?;

    // Crash periods over the full series, predictions split around each one
    let prices = data.series.prices();
    let points = data.series.points();
    let analyzer = CrashAnalyzer::new(config.monitor.crash_lookback);
    let mut returns = vec![0.0];
    returns.extend(Stats::calculate_returns(&prices));
    let drawdowns = Stats::rolling_drawdowns(&prices, analyzer.lookback_window());
    let targets: Vec<usize> = data.test.samples().iter().map(|s| s.target_index).collect();

    let mut crashes = Vec::new();
    for period in analyzer.identify_crash_periods(&data.series, config.monitor.crash_threshold) {
        let crash_metrics = analyzer.crash_metrics(&period, &returns, &drawdowns);
        let pre_start = period.start_index.saturating_sub(period.len());
        let select = |range: std::ops::Range<usize>| -> Vec<f64> {
            targets
                .iter()
                .zip(&prediction.prices)
                .filter(|(t, _)| range.contains(*t))
                .map(|(_, p)| *p)
                .collect()
        };
        let during = select(period.start_index..period.end_index + 1);
        let before = select(pre_start..period.start_index);
        let adaptability = analyzer.analyze_adaptability(&before, &during);
        crashes.push(json!({
            "start": period.start,
            "end": period.end,
            "metrics": crash_metrics,
            "adaptability": adaptability,
        }));
    }

    // Replay the test span through the risk monitor
    let mut risk = RiskMonitor::new(config.monitor.risk_thresholds());
    let mut alerts = match reporter {
        Some(reporter) => AlertManager::new().with_metrics(reporter.metrics().clone()),
        None => AlertManager::new(),
    };
    alerts.register(Severity::Critical, Arc::new(LogAlertHandler::default()));
    let first_test = targets.first().copied().unwrap_or_default();
    for point in &points[first_test..] {
        let triggered = risk.monitor_tick(point.price, point.timestamp);
        alerts.process_all(triggered);
    }
    let last_seen = data.series.last().map_or_else(Utc::now, |p| p.timestamp);
    if alerts.unhandled_count() > 0 {
        warn!("{} alerts reached no registered handler", alerts.unhandled_count());
    }

    let mut tracker = MarketStateTracker::new();
    let mut fields = vec![
        ("last_price".to_string(), json!(prices.last())),
        ("rmse".to_string(), json!(test_metrics.rmse)),
        ("hit_rate".to_string(), json!(test_metrics.hit_rate)),
        ("health".to_string(), json!(health.status)),
    ];
    if let Some(current) = risk.calculate_risk_metrics(&prices[first_test..]) {
        fields.push(("risk".to_string(), json!(current)));
    }
    tracker.update_state(&config.training.symbol, fields, last_seen);

    let report = json!({
        "symbol": config.training.symbol,
        "metrics": test_metrics,
        "health": health,
        "mean_disagreement": prediction.mean_disagreement(),
        "crashes": crashes,
        "alerts": alerts.alert_summary(last_seen),
        "state": tracker.get_state(&config.training.symbol),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    finish(reporter, config, &ensemble)
}

fn run_backtest(config: &Config, reporter: Option<&MetricsReporter>) -> Result<()> {
    let ensemble = load_checkpoint(config, reporter.map(MetricsReporter::metrics))?;
    let data = prepare_data(config, ensemble.config())?;
    check_shape(&ensemble, &data)?;

    let batch = data.test.full_batch().context("Test split is empty")?;
    let prediction = ensemble.predict(&batch)?;
    let points = data.series.points();

    let mut trader =
        DayTrader::new(config.training.initial_balance).with_threshold(config.training.trade_threshold);
    for (sample, predicted) in data.test.samples().iter().zip(&prediction.prices) {
        let timestamp = points[sample.target_index].timestamp;
        trader.execute_trade_realized(*predicted, sample.anchor, sample.target_price, timestamp);
    }

    let performance = trader.performance_metrics();
    info!(
        "Backtest: {} trades, final balance {:.2}",
        performance.total_trades, performance.final_balance
    );
    println!("{}", serde_json::to_string_pretty(&performance)?);

    finish(reporter, config, &ensemble)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(symbol) = cli.symbol {
        config.training.symbol = symbol;
    }
    if let Some(dir) = cli.checkpoint_dir {
        config.training.checkpoint_dir = dir;
    }

    let reporter = if config.observability.enabled {
        Some(MetricsReporter::new(Metrics::new()?))
    } else {
        None
    };

    info!("GAF-WGAN {} ({:?})", env!("CARGO_PKG_VERSION"), cli.command);
    match cli.command {
        Command::Train { epochs, meta_epochs } => run_train(
            &config,
            reporter.as_ref(),
            epochs.unwrap_or(config.training.epochs),
            meta_epochs.unwrap_or(config.training.meta_epochs),
        ),
        Command::Eval => run_eval(&config, reporter.as_ref()),
        Command::Backtest => run_backtest(&config, reporter.as_ref()),
    }
}
