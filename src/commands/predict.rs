use super::import_closes::ensure_market_data_file;
use super::write_json;
use crate::config::ForecastSettings;
use crate::context::ExecutionContext;
use crate::market_data::MarketDataSnapshot;
use crate::predictor::TrainablePredictor;
use anyhow::Result;
use log::{info, warn};
use std::path::{Path, PathBuf};

pub async fn run(
    settings: &ForecastSettings,
    context: ExecutionContext,
    data_file: &Path,
    tickers: &[String],
    output: Option<PathBuf>,
) -> Result<()> {
    ensure_market_data_file(data_file).await?;

    let predictor_settings = settings.predictor.clone();
    let data_file = data_file.to_path_buf();
    let tickers = tickers.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let snapshot = MarketDataSnapshot::load_from_file(&data_file)?;
        let histories = snapshot.select(&tickers);
        let predictor = TrainablePredictor::new(predictor_settings, context)?;
        if !predictor.is_trained() {
            warn!("No trained weights available; every forecast is the sentinel. Run `train` first.");
        }
        let forecasts = predictor.predict_many(&histories);
        let sentinels = forecasts.values().filter(|forecast| forecast.is_sentinel()).count();
        info!(
            "Predicted {} instruments ({} without usable history)",
            forecasts.len(),
            sentinels
        );
        write_json(output.as_deref(), &forecasts)
    })
    .await?
}
