use super::import_closes::ensure_market_data_file;
use super::write_json;
use crate::config::{FoundationSettings, ForecastSettings};
use crate::context::ExecutionContext;
use crate::foundation::model_host::ModelHostLoader;
use crate::foundation::{PointAdapter, SamplingAdapter};
use crate::market_data::MarketDataSnapshot;
use crate::models::ForecastRecord;
use crate::orchestrator::InferenceOrchestrator;
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::info;
use std::path::{Path, PathBuf};

pub fn model_host_loader(settings: &FoundationSettings) -> Result<ModelHostLoader> {
    let url = settings
        .model_host_url
        .as_deref()
        .ok_or_else(|| anyhow!("MODEL_HOST_URL must be set to run the pretrained models"))?;
    ModelHostLoader::new(url)
}

pub fn build_orchestrator(
    settings: &FoundationSettings,
    context: ExecutionContext,
) -> Result<InferenceOrchestrator> {
    let loader = model_host_loader(settings)?;
    let point = PointAdapter::new(
        settings.point.clone(),
        settings.horizons.clone(),
        settings.min_history,
        context,
        Box::new(loader.clone()),
    );
    let sampling = SamplingAdapter::new(
        settings.sampling.clone(),
        &settings.horizons,
        settings.min_history,
        Box::new(loader),
    )?;
    Ok(InferenceOrchestrator::new(Box::new(point), Box::new(sampling)))
}

pub async fn run(
    settings: &ForecastSettings,
    context: ExecutionContext,
    data_file: &Path,
    tickers: &[String],
    output: Option<PathBuf>,
) -> Result<()> {
    ensure_market_data_file(data_file).await?;

    let foundation = settings.foundation.clone();
    let data_file = data_file.to_path_buf();
    let tickers = tickers.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let orchestrator = build_orchestrator(&foundation, context)?;
        let snapshot = MarketDataSnapshot::load_from_file(&data_file)?;
        let histories = snapshot.select(&tickers);

        let merged = orchestrator.predict_all(&histories);
        let generated_at = Utc::now();
        let records: Vec<ForecastRecord> = merged
            .into_iter()
            .map(|(ticker, forecasts)| ForecastRecord {
                ticker,
                forecasts,
                generated_at,
            })
            .collect();
        info!(
            "Writing {} forecast records for {} requested instruments",
            records.len(),
            histories.len()
        );
        write_json(output.as_deref(), &records)
    })
    .await?
}
