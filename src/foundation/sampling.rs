use super::{
    forecast_each, model_unavailable, FoundationAdapter, LoadedModel, ResidencyMonitor,
    SampleForecaster, SamplingModelLoader,
};
use crate::config::SamplingModelSettings;
use crate::context::ExecutionContext;
use crate::models::{growth_percent, GrowthForecast, Histories, HorizonTable};
use crate::window::{elementwise_median, resample_stride, tail};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::collections::BTreeMap;
use std::time::Instant;

/// Sampling forecaster run in two passes.
///
/// The daily pass covers horizons that fit inside `daily_length`; the weekly
/// pass resamples the history every `weekly_stride` points and reads the
/// remaining horizons at the indices in `weekly_index`. An instrument only
/// gets a result when both passes succeed.
pub struct SamplingAdapter {
    settings: SamplingModelSettings,
    daily_horizons: HorizonTable,
    min_history: usize,
    context: ExecutionContext,
    loader: Box<dyn SamplingModelLoader>,
}

impl SamplingAdapter {
    pub fn new(
        settings: SamplingModelSettings,
        horizons: &HorizonTable,
        min_history: usize,
        loader: Box<dyn SamplingModelLoader>,
    ) -> Result<Self> {
        let daily_keys: Vec<&str> = horizons
            .iter()
            .filter(|(key, offset)| {
                settings.weekly_index.get(key).is_none() && *offset <= settings.daily_length
            })
            .map(|(key, _)| key)
            .collect();
        let daily_horizons = horizons.subset(&daily_keys);
        Ok(Self {
            settings,
            daily_horizons,
            min_history,
            context: ExecutionContext::cpu()?,
            loader,
        })
    }

    fn forecast_instrument(
        &self,
        model: &mut dyn SampleForecaster,
        history: &[f64],
    ) -> Result<GrowthForecast> {
        let settings = &self.settings;
        let last_price = history[history.len() - 1];
        let mut forecast = GrowthForecast::new();

        let daily = self.median_path(model, tail(history, settings.context), settings.daily_length)?;
        for (key, offset) in self.daily_horizons.iter() {
            if offset == 0 || offset > daily.len() {
                continue;
            }
            forecast.insert(key, growth_at(&daily, offset - 1, last_price, key)?);
        }

        let weekly_history = resample_stride(history, settings.weekly_stride);
        let weekly = self.median_path(
            model,
            tail(&weekly_history, settings.context),
            settings.weekly_length,
        )?;
        for (key, index) in settings.weekly_index.iter() {
            if index >= weekly.len() {
                continue;
            }
            forecast.insert(key, growth_at(&weekly, index, last_price, key)?);
        }

        Ok(forecast)
    }

    fn median_path(
        &self,
        model: &mut dyn SampleForecaster,
        context: &[f64],
        prediction_length: usize,
    ) -> Result<Vec<f64>> {
        let samples = model.sample(context, prediction_length, self.settings.num_samples)?;
        if samples.is_empty() {
            return Err(anyhow!("model returned no sample trajectories"));
        }
        Ok(elementwise_median(&samples))
    }
}

fn growth_at(path: &[f64], index: usize, last_price: f64, key: &str) -> Result<f64> {
    growth_percent(path[index], last_price).ok_or_else(|| {
        anyhow!(
            "unusable median {} against last price {} at {}",
            path[index],
            last_price,
            key
        )
    })
}

impl FoundationAdapter for SamplingAdapter {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn forecast(
        &self,
        histories: &Histories,
        monitor: &ResidencyMonitor,
    ) -> BTreeMap<String, GrowthForecast> {
        let name = self.name();
        let started = Instant::now();
        info!("Loading {} on {}", name, self.context.device_label());
        let model = match self.loader.load(name, &self.context) {
            Ok(model) => model,
            Err(err) => {
                warn!("{}", model_unavailable(name, err));
                return BTreeMap::new();
            }
        };
        let mut model = LoadedModel::new(name, model, monitor.enter());

        let results = forecast_each(name, histories, self.min_history, |_, history| {
            self.forecast_instrument(&mut *model, history)
        });
        drop(model);
        info!(
            "{} phase finished in {:.1}s",
            name,
            started.elapsed().as_secs_f64()
        );
        results
    }
}
