use crate::domain::market::price_series::{PricePoint, PriceSeries};
use crate::domain::ports::PriceSource;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;

const TIMESTAMP_COLUMNS: [&str; 3] = ["timestamp", "date", "time"];

/// Accepts RFC 3339 timestamps or plain `%Y-%m-%d` dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Failed to parse timestamp '{}'", raw))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow!("Invalid date '{}'", raw))
}

/// Reads `<dir>/<SYMBOL>.csv` files with a header row.
///
/// Rows may come in any order; they are sorted by timestamp before the series
/// is validated.
#[derive(Debug, Clone)]
pub struct CsvPriceLoader {
    dir: PathBuf,
    price_column: String,
}

impl CsvPriceLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            price_column: "close".to_string(),
        }
    }

    pub fn with_price_column(mut self, column: impl Into<String>) -> Self {
        self.price_column = column.into();
        self
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", symbol))
    }

    pub fn load_path(&self, path: &Path) -> Result<PriceSeries> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let series = self
            .read(BufReader::new(file))
            .with_context(|| format!("Failed to load prices from {:?}", path))?;
        info!("Loaded {} prices from {:?}", series.len(), path);
        Ok(series)
    }

    pub fn read<R: Read>(&self, reader: R) -> Result<PriceSeries> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers().context("Failed to read CSV header")?.clone();
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let ts_index = TIMESTAMP_COLUMNS
            .iter()
            .find_map(|name| find(*name))
            .ok_or_else(|| anyhow!("No timestamp column (expected one of {:?})", TIMESTAMP_COLUMNS))?;
        let price_index = find(self.price_column.as_str())
            .ok_or_else(|| anyhow!("No '{}' column", self.price_column))?;

        let mut points = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("Malformed CSV row {}", line + 1))?;
            let timestamp = parse_timestamp(record.get(ts_index).unwrap_or_default())
                .with_context(|| format!("Row {}", line + 1))?;
            let raw_price = record.get(price_index).unwrap_or_default().trim();
            let price: f64 = raw_price
                .parse()
                .with_context(|| format!("Failed to parse price '{}' on row {}", raw_price, line + 1))?;
            points.push(PricePoint::new(timestamp, price));
        }

        points.sort_by_key(|p| p.timestamp);
        Ok(PriceSeries::new(points)?)
    }
}

impl PriceSource for CsvPriceLoader {
    fn load(&self, symbol: &str) -> Result<PriceSeries> {
        self.load_path(&self.path_for(symbol))
    }
}
