use super::import_closes::ensure_market_data_file;
use crate::config::ForecastSettings;
use crate::context::ExecutionContext;
use crate::market_data::MarketDataSnapshot;
use crate::predictor::{TrainablePredictor, TrainingReport};
use anyhow::{anyhow, Result};
use log::info;
use std::path::Path;

pub async fn run(
    settings: &ForecastSettings,
    context: ExecutionContext,
    data_file: &Path,
    tickers: &[String],
) -> Result<()> {
    ensure_market_data_file(data_file).await?;

    let predictor_settings = settings.predictor.clone();
    let data_file = data_file.to_path_buf();
    let tickers = tickers.to_vec();
    let report = tokio::task::spawn_blocking(move || -> Result<TrainingReport> {
        let snapshot = MarketDataSnapshot::load_from_file(&data_file)?;
        let targets = snapshot.select(&tickers);
        let sequence_length = predictor_settings.sequence_length;
        let eligible = targets
            .values()
            .filter(|series| series.len() > sequence_length)
            .count();
        if eligible == 0 {
            return Err(anyhow!(
                "No target series has more than {} points; nothing to fine-tune on",
                sequence_length
            ));
        }
        info!(
            "Training with {} target series ({} eligible)",
            targets.len(),
            eligible
        );

        let predictor = TrainablePredictor::new(predictor_settings, context)?.with_progress(true);
        Ok(predictor.auto_train(&snapshot, &targets))
    })
    .await??;

    match report {
        TrainingReport::Completed {
            pretrain,
            finetune,
            artifact,
        } => {
            info!(
                "Training complete: pre-training loss {:?} over {} windows, fine-tuning loss {:?} over {} windows; weights at {}",
                pretrain.final_loss,
                pretrain.windows,
                finetune.final_loss,
                finetune.windows,
                artifact.display()
            );
            Ok(())
        }
        TrainingReport::AlreadyRunning => Err(anyhow!("A training cycle is already running")),
        TrainingReport::Failed { reason } => Err(anyhow!("Training failed: {}", reason)),
    }
}
