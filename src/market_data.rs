use crate::models::{Histories, PriceSeries};
use crate::persistence::write_atomically;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;
pub const TRADING_DAYS_PER_YEAR: usize = 252;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistorySpan {
    trading_days: usize,
}

impl HistorySpan {
    pub fn years(years: usize) -> Self {
        Self {
            trading_days: years.saturating_mul(TRADING_DAYS_PER_YEAR),
        }
    }

    pub fn trading_days(trading_days: usize) -> Self {
        Self { trading_days }
    }

    pub fn len(&self) -> usize {
        self.trading_days
    }

    pub fn is_empty(&self) -> bool {
        self.trading_days == 0
    }
}

pub trait MarketDataSource: Send + Sync {
    fn close_history(&self, ticker: &str, span: HistorySpan) -> Result<PriceSeries>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    series: Histories,
}

impl MarketDataSnapshot {
    pub fn new(series: Histories) -> Self {
        Self {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            series,
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let snapshot: MarketDataSnapshot = bincode::deserialize_from(BufReader::new(file))
            .context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }
        log::info!(
            "Loaded market data snapshot with {} tickers generated at {}",
            snapshot.series.len(),
            snapshot.generated_at.to_rfc3339()
        );
        Ok(snapshot)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_atomically(path, |writer| {
            bincode::serialize_into(writer, self)
                .context("Failed to serialize market data snapshot")
        })
        .with_context(|| format!("Unable to write market data snapshot to {}", path.display()))
    }

    /// Reads `{"TICKER": [close, ...], ...}` JSON.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open close-price JSON at {}", path.display()))?;
        let raw: Histories = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse close-price JSON at {}", path.display()))?;
        let series = raw
            .into_iter()
            .map(|(ticker, closes)| (ticker.trim().to_ascii_uppercase(), closes))
            .filter(|(ticker, _)| !ticker.is_empty())
            .collect();
        Ok(Self::new(series))
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> + '_ {
        self.series.keys().map(String::as_str)
    }

    pub fn histories(&self) -> &Histories {
        &self.series
    }

    pub fn select(&self, tickers: &[String]) -> Histories {
        if tickers.is_empty() {
            return self.series.clone();
        }
        tickers
            .iter()
            .filter_map(|ticker| {
                let key = ticker.to_ascii_uppercase();
                match self.series.get(&key) {
                    Some(series) => Some((key, series.clone())),
                    None => {
                        log::warn!("Ticker {} not present in market data snapshot", ticker);
                        None
                    }
                }
            })
            .collect()
    }
}

impl MarketDataSource for MarketDataSnapshot {
    fn close_history(&self, ticker: &str, span: HistorySpan) -> Result<PriceSeries> {
        let series = self
            .series
            .get(ticker)
            .ok_or_else(|| anyhow!("No close history for {}", ticker))?;
        if series.is_empty() {
            return Err(anyhow!("Close history for {} is empty", ticker));
        }
        let start = series.len().saturating_sub(span.len());
        Ok(series[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn snapshot() -> MarketDataSnapshot {
        let mut series = Histories::new();
        series.insert("SPY".to_string(), (0..600).map(|idx| 300.0 + idx as f64).collect());
        series.insert("EMPTY".to_string(), Vec::new());
        MarketDataSnapshot::new(series)
    }

    #[test]
    fn close_history_returns_span_tail() {
        let data = snapshot();
        let year = data.close_history("SPY", HistorySpan::years(1)).expect("history");
        assert_eq!(year.len(), 252);
        assert_eq!(*year.last().unwrap(), 899.0);

        let decade = data.close_history("SPY", HistorySpan::years(10)).expect("history");
        assert_eq!(decade.len(), 600);

        assert!(data.close_history("QQQ", HistorySpan::years(1)).is_err());
        assert!(data.close_history("EMPTY", HistorySpan::years(1)).is_err());
    }

    #[test]
    fn snapshot_file_round_trip_checks_version() {
        let path = std::env::temp_dir().join(format!("forecaster-snapshot-{}.bin", Uuid::new_v4()));
        snapshot().save_to_file(&path).expect("save");
        let loaded = MarketDataSnapshot::load_from_file(&path).expect("load");
        assert_eq!(loaded.histories().len(), 2);

        let mut stale = snapshot();
        stale.version = MARKET_DATA_SNAPSHOT_VERSION + 1;
        stale.save_to_file(&path).expect("save stale");
        let err = MarketDataSnapshot::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn select_is_case_insensitive_and_skips_unknown() {
        let data = snapshot();
        let selected = data.select(&["spy".to_string(), "NOPE".to_string()]);
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("SPY"));
        assert_eq!(data.select(&[]).len(), 2);
    }
}
