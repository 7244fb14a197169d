use crate::foundation::{FoundationAdapter, ResidencyMonitor};
use crate::models::{GrowthForecast, Histories, PerModelForecasts};
use log::info;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

pub struct InferenceOrchestrator {
    point: Box<dyn FoundationAdapter>,
    sampling: Box<dyn FoundationAdapter>,
    monitor: ResidencyMonitor,
}

impl InferenceOrchestrator {
    pub fn new(point: Box<dyn FoundationAdapter>, sampling: Box<dyn FoundationAdapter>) -> Self {
        Self {
            point,
            sampling,
            monitor: ResidencyMonitor::new(),
        }
    }

    pub fn residency(&self) -> &ResidencyMonitor {
        &self.monitor
    }

    pub fn predict_all(&self, histories: &Histories) -> BTreeMap<String, PerModelForecasts> {
        let started = Instant::now();
        info!(
            "Forecasting {} instruments with {} then {}",
            histories.len(),
            self.point.name(),
            self.sampling.name()
        );

        let point_results = self.point.forecast(histories, &self.monitor);
        let sampling_results = self.sampling.forecast(histories, &self.monitor);

        let merged = merge_results(
            self.point.name(),
            point_results,
            self.sampling.name(),
            sampling_results,
        );
        info!(
            "Orchestrated forecasts for {} instruments in {:.1}s (peak resident models: {})",
            merged.len(),
            started.elapsed().as_secs_f64(),
            self.monitor.peak()
        );
        merged
    }
}

fn merge_results(
    first_name: &str,
    mut first: BTreeMap<String, GrowthForecast>,
    second_name: &str,
    mut second: BTreeMap<String, GrowthForecast>,
) -> BTreeMap<String, PerModelForecasts> {
    let tickers: BTreeSet<String> = first.keys().chain(second.keys()).cloned().collect();
    tickers
        .into_iter()
        .map(|ticker| {
            let mut per_model = PerModelForecasts::new();
            per_model.insert(
                first_name.to_string(),
                first.remove(&ticker).unwrap_or_default(),
            );
            per_model.insert(
                second_name.to_string(),
                second.remove(&ticker).unwrap_or_default(),
            );
            (ticker, per_model)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_fills_missing_models_with_empty_maps() {
        let mut point: BTreeMap<String, GrowthForecast> = BTreeMap::new();
        point.insert("AAA".to_string(), [("1d".to_string(), 1.5)].into_iter().collect());
        let mut sampling: BTreeMap<String, GrowthForecast> = BTreeMap::new();
        sampling.insert("BBB".to_string(), [("1y".to_string(), -2.0)].into_iter().collect());

        let merged = merge_results("timesfm", point, "chronos", sampling);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["AAA"]["timesfm"].get("1d"), Some(1.5));
        assert!(merged["AAA"]["chronos"].is_empty());
        assert!(merged["BBB"]["timesfm"].is_empty());
        assert_eq!(merged["BBB"]["chronos"].get("1y"), Some(-2.0));
    }
}
