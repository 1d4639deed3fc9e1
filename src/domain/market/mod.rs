// Market data domain
pub mod price_series;
