use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub type PriceSeries = Vec<f64>;

pub type Histories = BTreeMap<String, PriceSeries>;

pub type PerModelForecasts = BTreeMap<String, GrowthForecast>;

/// Ordered mapping of horizon keys to offsets.
///
/// Offsets are trading days for day-resolution tables and zero-based sample
/// indices for resampled tables (see [`HorizonTable::weekly_index_default`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonTable {
    entries: Vec<(String, usize)>,
}

impl HorizonTable {
    pub fn new<K: Into<String>>(entries: Vec<(K, usize)>) -> Result<Self> {
        let entries: Vec<(String, usize)> = entries
            .into_iter()
            .map(|(key, offset)| (key.into(), offset))
            .collect();
        if entries.is_empty() {
            return Err(anyhow!("Horizon table must contain at least one entry"));
        }
        let mut seen = HashSet::new();
        for (key, _) in &entries {
            if key.trim().is_empty() {
                return Err(anyhow!("Horizon key cannot be empty"));
            }
            if !seen.insert(key.as_str()) {
                return Err(anyhow!("Duplicate horizon key {}", key));
            }
        }
        Ok(Self { entries })
    }

    pub fn orchestrator_default() -> Self {
        Self::from_static(&[("1d", 1), ("1w", 5), ("1m", 21), ("6m", 126), ("1y", 252)])
    }

    pub fn predictor_default() -> Self {
        Self::from_static(&[("1M", 30), ("6M", 180), ("1Y", 252)])
    }

    pub fn weekly_index_default() -> Self {
        Self::from_static(&[("6m", 25), ("1y", 50)])
    }

    pub fn evaluation_default() -> Self {
        Self::from_static(&[("1d", 1), ("1w", 5), ("3m", 63), ("6m", 126), ("1y", 252)])
    }

    fn from_static(entries: &[(&str, usize)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(key, offset)| ((*key).to_string(), *offset))
                .collect(),
        }
    }

    /// Parses `key:offset` pairs separated by commas, e.g. `6m:25,1y:50`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, offset) = part
                .split_once(':')
                .ok_or_else(|| anyhow!("Horizon entry {} must look like key:offset", part))?;
            let offset = offset
                .trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("Horizon offset for {} must be an integer", key.trim()))?;
            entries.push((key.trim().to_string(), offset));
        }
        Self::new(entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.entries
            .iter()
            .map(|(key, offset)| (key.as_str(), *offset))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn get(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, offset)| *offset)
    }

    pub fn max_offset(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, offset)| *offset)
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn subset(&self, keys: &[&str]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(key, _)| keys.contains(&key.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Horizon key -> growth percentage relative to the last observed price.
///
/// `0.0` means "unavailable", not a measured zero growth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrowthForecast(BTreeMap<String, f64>);

impl GrowthForecast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sentinel(table: &HorizonTable) -> Self {
        Self(table.keys().map(|key| (key.to_string(), 0.0)).collect())
    }

    pub fn insert<K: Into<String>>(&mut self, key: K, growth: f64) {
        self.0.insert(key.into(), growth);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn is_sentinel(&self) -> bool {
        !self.0.is_empty() && self.0.values().all(|value| *value == 0.0)
    }

    pub fn into_inner(self) -> BTreeMap<String, f64> {
        self.0
    }
}

impl FromIterator<(String, f64)> for GrowthForecast {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastRecord {
    pub ticker: String,
    pub forecasts: PerModelForecasts,
    pub generated_at: DateTime<Utc>,
}

pub fn growth_percent(predicted: f64, last_price: f64) -> Option<f64> {
    if !last_price.is_finite() || last_price <= 0.0 || !predicted.is_finite() {
        return None;
    }
    let growth = (predicted - last_price) / last_price * 100.0;
    growth.is_finite().then_some(growth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tables_are_exact() {
        let orchestrator_table = HorizonTable::orchestrator_default();
        let orchestrator: Vec<(&str, usize)> = orchestrator_table.iter().collect();
        assert_eq!(
            orchestrator,
            vec![("1d", 1), ("1w", 5), ("1m", 21), ("6m", 126), ("1y", 252)]
        );

        let predictor_table = HorizonTable::predictor_default();
        let predictor: Vec<(&str, usize)> = predictor_table.iter().collect();
        assert_eq!(predictor, vec![("1M", 30), ("6M", 180), ("1Y", 252)]);

        let weekly = HorizonTable::weekly_index_default();
        assert_eq!(weekly.get("6m"), Some(25));
        assert_eq!(weekly.get("1y"), Some(50));
    }

    #[test]
    fn parse_accepts_pairs_and_rejects_duplicates() {
        let table = HorizonTable::parse("6m:26, 1y:52").expect("parse table");
        assert_eq!(table.get("6m"), Some(26));
        assert_eq!(table.max_offset(), 52);

        assert!(HorizonTable::parse("6m:25,6m:26").is_err());
        assert!(HorizonTable::parse("6m").is_err());
        assert!(HorizonTable::parse("").is_err());
    }

    #[test]
    fn sentinel_covers_every_key() {
        let forecast = GrowthForecast::sentinel(&HorizonTable::predictor_default());
        assert_eq!(forecast.len(), 3);
        assert!(forecast.is_sentinel());
        assert_eq!(forecast.get("1Y"), Some(0.0));
    }

    #[test]
    fn growth_percent_guards_bad_inputs() {
        let growth = growth_percent(110.0, 100.0).expect("valid growth");
        assert!((growth - 10.0).abs() < 1e-9);
        assert!(growth_percent(110.0, 0.0).is_none());
        assert!(growth_percent(f64::NAN, 100.0).is_none());
    }
}
