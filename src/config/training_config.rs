//! Training run configuration parsing from environment variables.

use super::{Lookup, env_lookup, parse_var, string_var};
use crate::application::evaluation::trader::TRADE_THRESHOLD;
use crate::domain::ml::dataset::{TRAIN_FRACTION, VALIDATION_FRACTION};
use anyhow::{Result, bail};
use std::path::PathBuf;

/// Training environment configuration
#[derive(Debug, Clone)]
pub struct TrainingEnvConfig {
    // Data
    pub data_dir: PathBuf,
    pub symbol: String,
    pub price_column: String,
    pub train_fraction: f64,
    pub validation_fraction: f64,

    // Schedule
    pub epochs: usize,
    pub meta_epochs: usize,
    pub batch_size: usize,

    // Output
    pub checkpoint_dir: PathBuf,

    // Backtest
    pub initial_balance: f64,
    pub trade_threshold: f64,
}

impl TrainingEnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let train_fraction = parse_var(lookup, "TRAIN_FRACTION", TRAIN_FRACTION)?;
        let validation_fraction = parse_var(lookup, "VALIDATION_FRACTION", VALIDATION_FRACTION)?;
        if train_fraction <= 0.0 || validation_fraction <= 0.0 || train_fraction + validation_fraction >= 1.0 {
            bail!(
                "TRAIN_FRACTION ({}) and VALIDATION_FRACTION ({}) must be positive and leave room for a test split",
                train_fraction,
                validation_fraction
            );
        }

        Ok(Self {
            data_dir: PathBuf::from(string_var(lookup, "DATA_DIR", "data")),
            symbol: string_var(lookup, "SYMBOL", "SPY"),
            price_column: string_var(lookup, "PRICE_COLUMN", "close"),
            train_fraction,
            validation_fraction,
            epochs: parse_var(lookup, "EPOCHS", 100)?,
            meta_epochs: parse_var(lookup, "META_EPOCHS", 50)?,
            batch_size: parse_var(lookup, "BATCH_SIZE", 32)?,
            checkpoint_dir: PathBuf::from(string_var(lookup, "CHECKPOINT_DIR", "checkpoints")),
            initial_balance: parse_var(lookup, "INITIAL_BALANCE", 10_000.0)?,
            trade_threshold: parse_var(lookup, "TRADE_THRESHOLD", TRADE_THRESHOLD)?,
        })
    }
}
