use super::{
    forecast_each, model_unavailable, FoundationAdapter, LoadedModel, PointForecaster,
    PointModelLoader, ResidencyMonitor,
};
use crate::config::PointModelSettings;
use crate::context::ExecutionContext;
use crate::models::{growth_percent, GrowthForecast, Histories, HorizonTable};
use crate::window::tail;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::collections::BTreeMap;
use std::time::Instant;

pub struct PointAdapter {
    settings: PointModelSettings,
    horizons: HorizonTable,
    min_history: usize,
    context: ExecutionContext,
    loader: Box<dyn PointModelLoader>,
}

impl PointAdapter {
    pub fn new(
        settings: PointModelSettings,
        horizons: HorizonTable,
        min_history: usize,
        context: ExecutionContext,
        loader: Box<dyn PointModelLoader>,
    ) -> Self {
        Self {
            settings,
            horizons,
            min_history,
            context,
            loader,
        }
    }

    fn forecast_instrument(
        &self,
        model: &mut dyn PointForecaster,
        history: &[f64],
    ) -> Result<GrowthForecast> {
        let last_price = history[history.len() - 1];
        let context = tail(history, self.settings.max_context);
        let curve = model
            .forecast(context, self.settings.max_horizon)?
            .into_curve()?;

        let mut forecast = GrowthForecast::new();
        for (key, horizon) in self.horizons.iter() {
            if horizon == 0 || horizon > curve.len() {
                continue;
            }
            let growth = growth_percent(curve[horizon - 1], last_price).ok_or_else(|| {
                anyhow!(
                    "unusable prediction {} against last price {} at {}",
                    curve[horizon - 1],
                    last_price,
                    key
                )
            })?;
            forecast.insert(key, growth);
        }
        Ok(forecast)
    }
}

impl FoundationAdapter for PointAdapter {
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
