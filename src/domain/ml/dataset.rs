use crate::domain::errors::{EncodingError, EnsembleError};
use crate::domain::market::price_series::PriceSeries;
use crate::domain::ml::gaf::{GafEncoder, GafMatrix, WindowScale};
use crate::domain::ml::sample::{BatchShape, SequenceBatch, SequenceSample};
use crate::domain::ports::BatchSource;
use ndarray::{Array1, Array3, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

/// Chronological fractions used by [`GafDataset::split`].
pub const TRAIN_FRACTION: f64 = 0.7;
pub const VALIDATION_FRACTION: f64 = 0.15;

/// Turns a price series into GAF sequence samples.
///
/// Sample `s` stacks the fields of windows `s..s+T`, each `N` prices long and one
/// step apart; its target is the price right after the last window.
#[derive(Debug, Clone)]
pub struct SequenceBuilder {
    encoder: GafEncoder,
    seq_len: usize,
    history_len: usize,
}

impl SequenceBuilder {
    pub fn new(window_size: usize, seq_len: usize, history_len: usize) -> Result<Self, EnsembleError> {
        if window_size < 2 {
            return Err(EnsembleError::InvalidConfig {
                reason: format!("window_size must be at least 2, got {window_size}"),
            });
        }
        if seq_len == 0 {
            return Err(EnsembleError::InvalidConfig {
                reason: "sequence_length must be positive".to_string(),
            });
        }
        if history_len > window_size {
            return Err(EnsembleError::InvalidConfig {
                reason: format!(
                    "critic history ({history_len}) cannot exceed window_size ({window_size})"
                ),
            });
        }
        Ok(Self {
            encoder: GafEncoder::new(window_size),
            seq_len,
            history_len,
        })
    }

    pub fn shape(&self) -> BatchShape {
        BatchShape {
            seq_len: self.seq_len,
            frame_size: self.encoder.window_size(),
            history_len: self.history_len,
        }
    }

    pub fn build(&self, series: &PriceSeries) -> Vec<SequenceSample> {
        let prices = series.prices();
        let n = self.encoder.window_size();
        let t = self.seq_len;
        if prices.len() < n + t {
            warn!(
                points = prices.len(),
                required = n + t,
                "SequenceBuilder: series too short for a single sample"
            );
            return Vec::new();
        }

        // Encode every window once; overlapping samples share frames.
        let encoded: Vec<Option<(GafMatrix, WindowScale)>> = prices
            .windows(n)
            .map(|w| {
                let gaf = self.encoder.encode(w).ok()?;
                let scale = WindowScale::from_window(w).ok()?;
                Some((gaf, scale))
            })
            .collect();

        let num_candidates = prices.len() - n - t + 1;
        let mut samples = Vec::with_capacity(num_candidates);
        let mut skipped = 0usize;

        for s in 0..num_candidates {
            let frames = &encoded[s..s + t];
            if frames.iter().any(Option::is_none) {
                skipped += 1;
                continue;
            }

            let mut stack = Array3::zeros((t, n, n));
            for (k, (gaf, _)) in frames.iter().flatten().enumerate() {
                stack.index_axis_mut(Axis(0), k).assign(&gaf.view());
            }

            let last_start = s + t - 1;
            let Some((_, scale)) = &encoded[last_start] else {
                continue;
            };
            let last_window = &prices[last_start..last_start + n];
            let target_price = prices[last_start + n];
            let history: Array1<f64> = last_window[n - self.history_len..]
                .iter()
                .map(|&p| scale.normalize(p))
                .collect();

            samples.push(SequenceSample {
                frames: stack,
                history,
                target: scale.normalize(target_price),
                scale: *scale,
                anchor: last_window[n - 1],
                target_price,
                target_index: last_start + n,
            });
        }

        if skipped > 0 {
            warn!(skipped, kept = samples.len(), "SequenceBuilder: skipped samples with degenerate windows");
        }
        debug!(samples = samples.len(), "SequenceBuilder: built samples");
        samples
    }

    /// Sample made of the last `T` windows of `series`, for forecasting the price
    /// after it. Target fields are NaN and `target_index` is `series.len()`.
    pub fn forecast_sample(&self, series: &PriceSeries) -> Result<SequenceSample, EncodingError> {
        let prices = series.prices();
        let n = self.encoder.window_size();
        let t = self.seq_len;
        let required = n + t - 1;
        if prices.len() < required {
            return Err(EncodingError::WindowLength {
                expected: required,
                actual: prices.len(),
            });
        }

        let start = prices.len() - required;
        let mut stack = Array3::zeros((t, n, n));
        for k in 0..t {
            let gaf = self.encoder.encode(&prices[start + k..start + k + n])?;
            stack.index_axis_mut(Axis(0), k).assign(&gaf.view());
        }

        let last_window = &prices[prices.len() - n..];
        let scale = WindowScale::from_window(last_window)?;
        Ok(SequenceSample {
            frames: stack,
            history: last_window[n - self.history_len..]
                .iter()
                .map(|&p| scale.normalize(p))
                .collect(),
            target: f64::NAN,
            scale,
            anchor: last_window[n - 1],
            target_price: f64::NAN,
            target_index: prices.len(),
        })
    }
}

/// In-memory labelled samples served as shuffled mini-batches.
#[derive(Debug, Clone)]
pub struct GafDataset {
    samples: Vec<SequenceSample>,
    shape: BatchShape,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl GafDataset {
    pub fn new(samples: Vec<SequenceSample>, shape: BatchShape) -> Self {
        Self {
            samples,
            shape,
            batch_size: 32,
            shuffle: true,
            seed: 0,
        }
    }

    /// Encodes `series` with `builder`.
    pub fn from_series(builder: &SequenceBuilder, series: &PriceSeries) -> Self {
        Self::new(builder.build(series), builder.shape())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn samples(&self) -> &[SequenceSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The whole dataset as one unshuffled batch, or `None` when empty.
    pub fn full_batch(&self) -> Option<SequenceBatch> {
        SequenceBatch::stack(&self.samples).ok()
    }

    /// Chronological train / validation / test split.
    pub fn split(self, train_fraction: f64, validation_fraction: f64) -> (Self, Self, Self) {
        let len = self.samples.len();
        let train_end = ((len as f64) * train_fraction).floor() as usize;
        let val_end = (((len as f64) * (train_fraction + validation_fraction)).floor() as usize).min(len);

        let mut rest = self.samples;
        let test = rest.split_off(val_end);
        let validation = rest.split_off(train_end.min(rest.len()));
        let train = rest;

        let template = |samples: Vec<SequenceSample>, shuffle: bool| Self {
            samples,
            shape: self.shape,
            batch_size: self.batch_size,
            shuffle,
            seed: self.seed,
        };
        (
            template(train, self.shuffle),
            template(validation, false),
            template(test, false),
        )
    }

    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }
}

impl BatchSource for GafDataset {
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = SequenceBatch> + '_> {
        let order = self.epoch_order(epoch);
        let batch_size = self.batch_size;
        let batches: Vec<Vec<usize>> = order.chunks(batch_size).map(<[usize]>::to_vec).collect();
        Box::new(batches.into_iter().filter_map(move |indices| {
            let chunk: Vec<SequenceSample> =
                indices.iter().map(|&i| self.samples[i].clone()).collect();
            SequenceBatch::stack(&chunk).ok()
        }))
    }

    fn shape(&self) -> BatchShape {
        self.shape
    }

    fn num_samples(&self) -> usize {
        self.samples.len()
    }
}
