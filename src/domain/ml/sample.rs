use crate::domain::errors::ShapeMismatch;
use crate::domain::ml::gaf::WindowScale;
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

/// Per-sample tensor dimensions, shared by every batch of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchShape {
    /// Number of GAF frames per sample (T)
    pub seq_len: usize,
    /// GAF side length (N)
    pub frame_size: usize,
    /// Normalized prices preceding the target in a critic sequence (H)
    pub history_len: usize,
}

impl BatchShape {
    pub fn critic_len(&self) -> usize {
        self.history_len + 1
    }

    /// `[T, N, H]`, for shape error reports.
    pub fn dims(&self) -> [usize; 3] {
        [self.seq_len, self.frame_size, self.history_len]
    }
}

/// One training example: T consecutive GAF frames and the price that follows them.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSample {
    /// `[T, N, N]`
    pub frames: Array3<f64>,
    /// Tail of the last window in its own `[-1, 1]` frame, `[H]`
    pub history: Array1<f64>,
    /// Next price in the last window's `[-1, 1]` frame
    pub target: f64,
    pub scale: WindowScale,
    /// Last observed price
    pub anchor: f64,
    /// Next price, raw
    pub target_price: f64,
    /// Position of the target price in the source series
    pub target_index: usize,
}

impl SequenceSample {
    pub fn shape(&self) -> BatchShape {
        let (seq_len, frame_size, _) = self.frames.dim();
        BatchShape {
            seq_len,
            frame_size,
            history_len: self.history.len(),
        }
    }
}

/// B samples stacked along a leading batch axis.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBatch {
    /// `[B, T, N, N]`
    pub frames: Array4<f64>,
    /// `[B, H]`
    pub history: Array2<f64>,
    /// `[B, 1]`
    pub targets: Array2<f64>,
    pub scales: Vec<WindowScale>,
    pub anchors: Vec<f64>,
    pub target_prices: Vec<f64>,
}

impl SequenceBatch {
    pub fn stack(samples: &[SequenceSample]) -> Result<Self, ShapeMismatch> {
        let Some(first) = samples.first() else {
            return Err(ShapeMismatch::new("sequence batch", &[1], &[0]));
        };
        let shape = first.shape();
        let (t, n, h) = (shape.seq_len, shape.frame_size, shape.history_len);

        for sample in samples {
            if sample.frames.dim() != (t, n, n) {
                return Err(ShapeMismatch::new(
                    "sequence batch frames",
                    &[t, n, n],
                    sample.frames.shape(),
                ));
            }
            if sample.history.len() != h {
                return Err(ShapeMismatch::new(
                    "sequence batch history",
                    &[h],
                    sample.history.shape(),
                ));
            }
        }

        let b = samples.len();
        let mut frames = Array4::zeros((b, t, n, n));
        let mut history = Array2::zeros((b, h));
        for (i, sample) in samples.iter().enumerate() {
            frames.index_axis_mut(Axis(0), i).assign(&sample.frames);
            history.index_axis_mut(Axis(0), i).assign(&sample.history);
        }
        let targets = Array2::from_shape_fn((b, 1), |(i, _)| samples[i].target);

        Ok(Self {
            frames,
            history,
            targets,
            scales: samples.iter().map(|s| s.scale).collect(),
            anchors: samples.iter().map(|s| s.anchor).collect(),
            target_prices: samples.iter().map(|s| s.target_price).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> BatchShape {
        let (_, seq_len, frame_size, _) = self.frames.dim();
        BatchShape {
            seq_len,
            frame_size,
            history_len: self.history.ncols(),
        }
    }

    /// Maps normalized predictions back to prices, sample by sample.
    pub fn denormalize(&self, normalized: &[f64]) -> Vec<f64> {
        normalized
            .iter()
            .zip(&self.scales)
            .map(|(&y, scale)| scale.denormalize(y))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: usize, n: usize, h: usize, target: f64) -> SequenceSample {
        SequenceSample {
            frames: Array3::from_elem((t, n, n), 0.5),
            history: Array1::from_elem(h, -0.25),
            target,
            scale: WindowScale { min: 90.0, max: 110.0 },
            anchor: 100.0,
            target_price: 100.0 + target,
            target_index: 0,
        }
    }

    #[test]
    fn test_stack_builds_batch_axes() {
        let batch = SequenceBatch::stack(&[sample(2, 4, 3, 0.1), sample(2, 4, 3, 0.2)]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.frames.dim(), (2, 2, 4, 4));
        assert_eq!(batch.history.dim(), (2, 3));
        assert_eq!(batch.targets[[1, 0]], 0.2);
        assert_eq!(
            batch.shape(),
            BatchShape {
                seq_len: 2,
                frame_size: 4,
                history_len: 3
            }
        );
    }

    #[test]
    fn test_stack_rejects_mixed_shapes() {
        let err = SequenceBatch::stack(&[sample(2, 4, 3, 0.0), sample(2, 5, 3, 0.0)]).unwrap_err();
        assert_eq!(err.actual, vec![2, 5, 5]);
    }

    #[test]
    fn test_stack_rejects_empty() {
        assert!(SequenceBatch::stack(&[]).is_err());
    }

    #[test]
    fn test_denormalize_uses_each_scale() {
        let batch = SequenceBatch::stack(&[sample(1, 2, 1, 0.0)]).unwrap();
        assert_eq!(batch.denormalize(&[1.0]), vec![110.0]);
        assert_eq!(batch.denormalize(&[-1.0]), vec![90.0]);
    }
}
