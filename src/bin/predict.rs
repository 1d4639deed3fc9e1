use anyhow::{Context, Result, bail};
use clap::Parser;
use gafwgan::application::ml::EnsemblePhase;
use gafwgan::domain::ml::dataset::SequenceBuilder;
use gafwgan::domain::ml::sample::SequenceBatch;
use gafwgan::domain::ports::PriceSource;
use gafwgan::infrastructure::market_data::CsvPriceLoader;
use gafwgan::infrastructure::persistence::CheckpointStore;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Forecast the next price with a trained GAF-WGAN checkpoint", long_about = None)]
struct Args {
    /// Directory written by `gafwgan train`
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Directory holding <SYMBOL>.csv
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[arg(long, default_value = "SPY")]
    symbol: String,

    /// CSV column with the price
    #[arg(long, default_value = "close")]
    price_column: String,
}

#[derive(Debug, Serialize)]
struct Forecast {
    symbol: String,
    as_of: chrono::DateTime<chrono::Utc>,
    last_price: f64,
    predicted_price: f64,
    expected_return: f64,
    per_model_prices: Vec<f64>,
    disagreement: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
    let args = Args::parse();

    let store = CheckpointStore::new(&args.checkpoint_dir);
    let ensemble = store
        .load()
        .with_context(|| format!("Failed to load checkpoint from {:?}", args.checkpoint_dir))?;
    if ensemble.phase() != EnsemblePhase::Ready {
        bail!(
            "Checkpoint in {:?} is {}, train the meta-learner first",
            args.checkpoint_dir,
            ensemble.phase()
        );
    }

    let series = CsvPriceLoader::new(&args.data_dir)
        .with_price_column(args.price_column.clone())
        .load(&args.symbol)?;
    let config = ensemble.config();
    let builder = SequenceBuilder::new(config.window_size, config.sequence_length, config.history_len())?;
    let sample = builder
        .forecast_sample(&series)
        .with_context(|| format!("Cannot encode the latest windows of {}", args.symbol))?;
    let batch = SequenceBatch::stack(std::slice::from_ref(&sample))?;

    let prediction = ensemble.predict(&batch)?;
    let predicted_price = prediction.prices.first().copied().context("Empty prediction")?;
    let as_of = series.last().map(|p| p.timestamp).context("Empty price series")?;

    let forecast = Forecast {
        symbol: args.symbol,
        as_of,
        last_price: sample.anchor,
        predicted_price,
        expected_return: (predicted_price - sample.anchor) / sample.anchor,
        per_model_prices: prediction.per_model_prices.iter().filter_map(|m| m.first().copied()).collect(),
        disagreement: prediction.mean_disagreement(),
    };
    info!(
        "{}: {:.2} -> {:.2} ({:+.2}%)",
        forecast.symbol,
        forecast.last_price,
        forecast.predicted_price,
        forecast.expected_return * 100.0
    );
    println!("{}", serde_json::to_string_pretty(&forecast)?);
    Ok(())
}
