//! Gramian Angular Summation Field encoding.
//!
//! A window is min-max scaled to `[-1, 1]`, mapped to polar angles
//! `phi = arccos(x)`, and expanded into `G[i][j] = cos(phi_i + phi_j)`.
//! The field is invariant to any positive affine transform of the prices,
//! so the scale of the window is carried separately in [`WindowScale`].

use crate::domain::errors::EncodingError;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Min/max of a window, used to move between prices and the `[-1, 1]` frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowScale {
    pub min: f64,
    pub max: f64,
}

impl WindowScale {
    pub fn from_window(window: &[f64]) -> Result<Self, EncodingError> {
        if let Some((index, &value)) = window.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(EncodingError::NonFiniteValue { index, value });
        }
        let min = window.iter().copied().fold(f64::INFINITY, f64::min);
        let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if window.is_empty() || max == min {
            return Err(EncodingError::DegenerateWindow {
                len: window.len(),
                value: if window.is_empty() { f64::NAN } else { min },
            });
        }
        if !(max - min).is_finite() {
            return Err(EncodingError::UnboundedRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Price -> `[-1, 1]`. Values outside the window's range map outside the interval.
    pub fn normalize(&self, price: f64) -> f64 {
        2.0 * ((price - self.min) / self.range()) - 1.0
    }

    /// `[-1, 1]` -> price.
    pub fn denormalize(&self, value: f64) -> f64 {
        self.min + (value + 1.0) / 2.0 * self.range()
    }
}

/// Polar coordinates of a scaled window.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarEncoding {
    pub phi: Array1<f64>,
    pub radius: Array1<f64>,
}

/// An immutable `N x N` Gramian Angular Field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GafMatrix(Array2<f64>);

impl GafMatrix {
    pub fn size(&self) -> usize {
        self.0.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.0.view()
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.0.get((i, j)).copied()
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.0
    }
}

/// Stateless encoder for windows of a fixed length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GafEncoder {
    window_size: usize,
}

impl Default for GafEncoder {
    fn default() -> Self {
        Self { window_size: 60 }
    }
}

impl GafEncoder {
    pub fn new(window_size: usize) -> Self {
        Self { window_size }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Scales a window to `[-1, 1]`, clamping rounding overshoot.
    pub fn scale(&self, window: &[f64]) -> Result<Array1<f64>, EncodingError> {
        if window.len() != self.window_size {
            return Err(EncodingError::WindowLength {
                expected: self.window_size,
                actual: window.len(),
            });
        }
        let scale = WindowScale::from_window(window)?;
        Ok(window
            .iter()
            .map(|&p| scale.normalize(p).clamp(-1.0, 1.0))
            .collect())
    }

    pub fn polar(&self, window: &[f64]) -> Result<PolarEncoding, EncodingError> {
        let scaled = self.scale(window)?;
        let n = self.window_size as f64;
        Ok(PolarEncoding {
            phi: scaled.mapv(f64::acos),
            radius: Array1::from_shape_fn(self.window_size, |i| i as f64 / n),
        })
    }

    pub fn encode(&self, window: &[f64]) -> Result<GafMatrix, EncodingError> {
        let PolarEncoding { phi, .. } = self.polar(window)?;
        let cos = phi.mapv(f64::cos).insert_axis(Axis(1));
        let sin = phi.mapv(f64::sin).insert_axis(Axis(1));

        // cos(a + b) = cos a cos b - sin a sin b
        let field = cos.dot(&cos.t()) - sin.dot(&sin.t());
        Ok(GafMatrix(field.mapv(|v| v.clamp(-1.0, 1.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn test_entries_in_unit_interval() {
        let encoder = GafEncoder::new(20);
        let window: Vec<f64> = (0..20).map(|i| (i as f64 * 0.7).sin() * 5.0 + 50.0).collect();
        let gaf = encoder.encode(&window).unwrap();
        assert_eq!(gaf.size(), 20);
        assert!(gaf.view().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_diagonal_is_cos_two_phi() {
        let encoder = GafEncoder::new(5);
        let window = [3.0, 1.0, 4.0, 1.5, 5.0];
        let polar = encoder.polar(&window).unwrap();
        let gaf = encoder.encode(&window).unwrap();
        for i in 0..5 {
            let expected = (2.0 * polar.phi[i]).cos();
            assert!((gaf.get(i, i).unwrap() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_extremes_map_to_known_angles() {
        let encoder = GafEncoder::new(3);
        let polar = encoder.polar(&[0.0, 5.0, 10.0]).unwrap();
        assert!((polar.phi[0] - std::f64::consts::PI).abs() < 1e-12);
        assert!((polar.phi[1] - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!(polar.phi[2].abs() < 1e-12);
        assert_eq!(polar.radius.to_vec(), vec![0.0, 1.0 / 3.0, 2.0 / 3.0]);
    }

    #[test]
    fn test_constant_window_is_degenerate() {
        let encoder = GafEncoder::new(4);
        assert!(matches!(
            encoder.encode(&[2.0; 4]),
            Err(EncodingError::DegenerateWindow { len: 4, .. })
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let encoder = GafEncoder::new(4);
        assert_eq!(
            encoder.encode(&ramp(3)),
            Err(EncodingError::WindowLength {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_overflowing_range_rejected() {
        let encoder = GafEncoder::new(3);
        assert_eq!(
            encoder.encode(&[-1e308, 0.0, 1e308]),
            Err(EncodingError::UnboundedRange {
                min: -1e308,
                max: 1e308
            })
        );

        // Spans close to f64::MAX still scale without overflow
        let window = [-1e308, 0.0, 0.7e308];
        let scaled = encoder.scale(&window).unwrap();
        assert!((scaled[1] - (2.0 / 1.7 - 1.0)).abs() < 1e-12);
        let gaf = encoder.encode(&window).unwrap();
        assert!(gaf.view().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_nan_rejected() {
        let encoder = GafEncoder::new(3);
        assert!(matches!(
            encoder.encode(&[1.0, f64::NAN, 2.0]),
            Err(EncodingError::NonFiniteValue { index: 1, .. })
        ));
    }

    #[test]
    fn test_window_scale_round_trip() {
        let scale = WindowScale::from_window(&[10.0, 30.0, 20.0]).unwrap();
        assert_eq!(scale.normalize(10.0), -1.0);
        assert_eq!(scale.normalize(30.0), 1.0);
        assert!((scale.denormalize(scale.normalize(17.5)) - 17.5).abs() < 1e-12);
    }
}
