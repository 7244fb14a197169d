pub mod model_host;
pub mod point;
pub mod sampling;

use crate::context::ExecutionContext;
use crate::error::ForecastError;
use crate::models::{GrowthForecast, Histories};
use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use point::PointAdapter;
pub use sampling::SamplingAdapter;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PointOutput {
    Batched(Vec<Vec<f64>>),
    Flat(Vec<f64>),
}

impl PointOutput {
    pub fn into_curve(self) -> Result<Vec<f64>> {
        let curve = match self {
            PointOutput::Batched(batch) => batch
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("Point forecast batch is empty"))?,
            PointOutput::Flat(curve) => curve,
        };
        if curve.is_empty() {
            return Err(anyhow!("Point forecast curve is empty"));
        }
        Ok(curve)
    }
}

pub trait PointForecaster {
    fn forecast(&mut self, context: &[f64], horizon: usize) -> Result<PointOutput>;
}

pub trait SampleForecaster {
    fn sample(
        &mut self,
        context: &[f64],
        prediction_length: usize,
        num_samples: usize,
    ) -> Result<Vec<Vec<f64>>>;
}

pub trait PointModelLoader: Send + Sync {
    fn load(&self, model: &str, context: &ExecutionContext) -> Result<Box<dyn PointForecaster>>;
}

pub trait SamplingModelLoader: Send + Sync {
    fn load(&self, model: &str, context: &ExecutionContext) -> Result<Box<dyn SampleForecaster>>;
}

#[derive(Debug, Clone, Default)]
pub struct ResidencyMonitor {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ResidencyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> ResidencyToken {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        ResidencyToken {
            current: Arc::clone(&self.current),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

pub struct ResidencyToken {
    current: Arc<AtomicUsize>,
}

impl Drop for ResidencyToken {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owns a loaded model for one batch. Dropping it releases the model first
/// and then the residency slot.
pub struct LoadedModel<M: ?Sized> {
    model: Box<M>,
    name: String,
    _token: ResidencyToken,
}

impl<M: ?Sized> LoadedModel<M> {
    pub fn new(name: &str, model: Box<M>, token: ResidencyToken) -> Self {
        Self {
            model,
            name: name.to_string(),
            _token: token,
        }
    }
}

impl<M: ?Sized> Deref for LoadedModel<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

impl<M: ?Sized> DerefMut for LoadedModel<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.model
    }
}

impl<M: ?Sized> Drop for LoadedModel<M> {
    fn drop(&mut self) {
        info!("Released model {}", self.name);
    }
}

/// `forecast(ticker -> series) -> ticker -> {horizon: growth%}`.
///
/// Never fails as a whole: an unloadable model gives an empty map and
/// instrument-level problems drop just that instrument.
pub trait FoundationAdapter {
    fn name(&self) -> &str;

    fn forecast(
        &self,
        histories: &Histories,
        monitor: &ResidencyMonitor,
    ) -> BTreeMap<String, GrowthForecast>;
}

pub(crate) fn forecast_each<F>(
    model_name: &str,
    histories: &Histories,
    min_history: usize,
    mut forecast_one: F,
) -> BTreeMap<String, GrowthForecast>
where
    F: FnMut(&str, &[f64]) -> Result<GrowthForecast>,
{
    let mut results = BTreeMap::new();
    for (ticker, history) in histories {
        if history.len() < min_history {
            let err = ForecastError::DataInsufficient {
                len: history.len(),
                required: min_history,
            };
            warn!("{}: skipping {}: {}", model_name, ticker, err);
            continue;
        }
        match forecast_one(ticker, history) {
            Ok(forecast) => {
                results.insert(ticker.clone(), forecast);
            }
            Err(err) => {
                let err = ForecastError::InstrumentFailure {
                    ticker: ticker.clone(),
                    reason: format!("{:#}", err),
                };
                warn!("{}: {}", model_name, err);
            }
        }
    }
    info!(
        "{}: forecast {} of {} instruments",
        model_name,
        results.len(),
        histories.len()
    );
    results
}

pub(crate) fn model_unavailable(model: &str, err: anyhow::Error) -> ForecastError {
    ForecastError::ModelUnavailable {
        model: model.to_string(),
        reason: format!("{:#}", err),
    }
}
