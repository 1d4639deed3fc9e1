use crate::domain::ml::sample::{BatchShape, SequenceBatch};
use crate::domain::market::price_series::PriceSeries;
use crate::domain::risk::alert::RiskAlert;
use anyhow::Result;

/// Re-iterable supply of training batches.
///
/// `batches(epoch)` must be callable any number of times and yield the same
/// order for the same epoch, so every model of an ensemble sees identical data.
pub trait BatchSource: Send + Sync {
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = SequenceBatch> + '_>;

    /// Per-sample shape, constant over the whole run.
    fn shape(&self) -> BatchShape;

    fn num_samples(&self) -> usize;
}

/// Anything that can supply a historical price series for a symbol.
pub trait PriceSource {
    fn load(&self, symbol: &str) -> Result<PriceSeries>;
}

/// Sink for risk alerts of a given severity.
pub trait AlertHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, alert: &RiskAlert);
}
