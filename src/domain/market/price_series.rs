use crate::domain::errors::PriceSeriesError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single observed price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}

/// Ordered, validated sequence of prices.
///
/// Timestamps are strictly increasing and every price is finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn new(points: Vec<PricePoint>) -> Result<Self, PriceSeriesError> {
        if points.is_empty() {
            return Err(PriceSeriesError::Empty);
        }
        for (index, point) in points.iter().enumerate() {
            if !point.price.is_finite() {
                return Err(PriceSeriesError::NonFinite {
                    index,
                    value: point.price,
                });
            }
            if index > 0 && point.timestamp <= points[index - 1].timestamp {
                return Err(PriceSeriesError::NonMonotonic { index });
            }
        }
        Ok(Self { points })
    }

    /// Builds a daily series starting at `start` from raw prices.
    pub fn daily(start: DateTime<Utc>, prices: &[f64]) -> Result<Self, PriceSeriesError> {
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint::new(start + chrono::Duration::days(i as i64), price))
            .collect();
        Self::new(points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.points.iter().map(|p| p.timestamp).collect()
    }

    pub fn last(&self) -> Option<&PricePoint> {
        self.points.last()
    }

    /// Contiguous windows of `size` prices, each one step after the previous.
    pub fn windows(&self, size: usize) -> impl Iterator<Item = Vec<f64>> + '_ {
        self.points
            .windows(size.max(1))
            .filter(move |_| size > 0)
            .map(|w| w.iter().map(|p| p.price).collect())
    }

    /// Simple returns `p[i] / p[i-1] - 1`; points following a zero price are skipped.
    pub fn returns(&self) -> Vec<f64> {
        self.points
            .windows(2)
            .filter(|w| w[0].price != 0.0)
            .map(|w| w[1].price / w[0].price - 1.0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_rejects_empty_series() {
        assert_eq!(PriceSeries::new(vec![]), Err(PriceSeriesError::Empty));
    }

    #[test]
    fn test_rejects_non_monotonic_timestamps() {
        let t = start();
        let points = vec![PricePoint::new(t, 1.0), PricePoint::new(t, 2.0)];
        assert_eq!(
            PriceSeries::new(points),
            Err(PriceSeriesError::NonMonotonic { index: 1 })
        );
    }

    #[test]
    fn test_rejects_nan_price() {
        let err = PriceSeries::daily(start(), &[1.0, f64::NAN]).unwrap_err();
        assert!(matches!(err, PriceSeriesError::NonFinite { index: 1, .. }));
    }

    #[test]
    fn test_windows_are_contiguous() {
        let series = PriceSeries::daily(start(), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let windows: Vec<_> = series.windows(3).collect();
        assert_eq!(windows, vec![vec![1.0, 2.0, 3.0], vec![2.0, 3.0, 4.0]]);
        assert_eq!(series.windows(5).count(), 0);
        assert_eq!(series.windows(0).count(), 0);
    }

    #[test]
    fn test_returns() {
        let series = PriceSeries::daily(start(), &[100.0, 110.0, 99.0]).unwrap();
        let returns = series.returns();
        assert!((returns[0] - 0.1).abs() < 1e-12);
        assert!((returns[1] + 0.1).abs() < 1e-12);
    }
}
