use super::forecast_all::model_host_loader;
use crate::config::ForecastSettings;
use crate::context::ExecutionContext;
use crate::evaluation::{render_table, Evaluation};
use crate::foundation::ResidencyMonitor;
use crate::predictor::TrainablePredictor;
use anyhow::Result;
use log::info;

const PREDICTOR_LABEL: &str = "lstm";

pub async fn run(settings: &ForecastSettings, context: ExecutionContext, seed: u64) -> Result<()> {
    let settings = settings.clone();
    let table = tokio::task::spawn_blocking(move || -> Result<String> {
        let evaluation = Evaluation::synthetic(seed)?;
        info!(
            "Evaluating on {} context points and {} held-out points (seed {})",
            evaluation.context().len(),
            evaluation.truth().len(),
            seed
        );

        let mut reports = Vec::new();
        let predictor = TrainablePredictor::new(settings.predictor.clone(), context.clone())?;
        reports.push(evaluation.evaluate_predictor(PREDICTOR_LABEL, &predictor));
        drop(predictor);

        if settings.foundation.model_host_url.is_some() {
            let loader = model_host_loader(&settings.foundation)?;
            let monitor = ResidencyMonitor::new();
            reports.push(evaluation.evaluate_point_model(
                &settings.foundation.point,
                &loader,
                &context,
                &monitor,
            ));
            reports.push(evaluation.evaluate_sampling_model(
                &settings.foundation.sampling,
                &loader,
                &monitor,
            ));
        } else {
            info!("MODEL_HOST_URL not set; skipping pretrained models");
        }

        Ok(render_table(&reports))
    })
    .await??;

    println!("{}", table);
    Ok(())
}
