use crate::config::{PredictorSettings, TrainingStage};
use crate::context::ExecutionContext;
use crate::error::ForecastError;
use crate::market_data::{HistorySpan, MarketDataSource};
use crate::models::{growth_percent, GrowthForecast, Histories};
use crate::persistence::write_atomically;
use crate::sequence_model::SequenceModel;
use crate::status::{TrainingPhase, TrainingStatus};
use crate::window::{build_training_windows, NormalizedWindow};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

const WEIGHT_ARTIFACT_VERSION: u32 = 1;

#[derive(Serialize)]
struct WeightArtifactRef<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    sequence_length: usize,
    model: &'a SequenceModel,
}

#[derive(Deserialize)]
struct WeightArtifact {
    version: u32,
    saved_at: DateTime<Utc>,
    sequence_length: usize,
    model: SequenceModel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageReport {
    pub series_used: usize,
    pub series_skipped: usize,
    pub windows: usize,
    pub epochs: usize,
    pub final_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingReport {
    Completed {
        pretrain: StageReport,
        finetune: StageReport,
        artifact: PathBuf,
    },
    AlreadyRunning,
    Failed {
        reason: String,
    },
}

impl TrainingReport {
    pub fn is_completed(&self) -> bool {
        matches!(self, TrainingReport::Completed { .. })
    }
}

/// Training works on a copy of the weights, so `predict` keeps serving the
/// previous model until a cycle finishes. Without trained weights every
/// forecast is the sentinel.
pub struct TrainablePredictor {
    settings: PredictorSettings,
    context: ExecutionContext,
    model: RwLock<Option<SequenceModel>>,
    status: TrainingStatus,
    show_progress: bool,
}

impl TrainablePredictor {
    pub fn new(settings: PredictorSettings, context: ExecutionContext) -> Result<Self> {
        settings.validate_layout()?;
        let model = match load_weights(&settings.artifact_path, &settings) {
            Ok(Some(model)) => Some(model),
            Ok(None) => {
                info!(
                    "No weight artifact at {}; forecasts unavailable until trained",
                    settings.artifact_path.display()
                );
                None
            }
            Err(err) => {
                warn!(
                    "Ignoring unreadable weight artifact at {}: {:#}",
                    settings.artifact_path.display(),
                    err
                );
                None
            }
        };
        Ok(Self {
            settings,
            context,
            model: RwLock::new(model),
            status: TrainingStatus::new(),
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn settings(&self) -> &PredictorSettings {
        &self.settings
    }

    pub fn status(&self) -> &TrainingStatus {
        &self.status
    }

    pub fn is_busy(&self) -> bool {
        self.status.is_busy()
    }

    pub fn is_trained(&self) -> bool {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn auto_train(&self, market: &dyn MarketDataSource, targets: &Histories) -> TrainingReport {
        let Some(_guard) = self.status.try_begin() else {
            warn!("Training requested while a cycle is running; rejecting");
            return TrainingReport::AlreadyRunning;
        };

        let started = Instant::now();
        match self.run_cycle(market, targets) {
            Ok((pretrain, finetune)) => {
                self.status.record_success(finetune.final_loss.or(pretrain.final_loss));
                info!(
                    "Training cycle finished in {:.1}s ({} pretrain windows, {} fine-tune windows)",
                    started.elapsed().as_secs_f64(),
                    pretrain.windows,
                    finetune.windows
                );
                TrainingReport::Completed {
                    pretrain,
                    finetune,
                    artifact: self.settings.artifact_path.clone(),
                }
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                error!("Training cycle aborted: {}", reason);
                self.status.record_failure(reason.clone());
                TrainingReport::Failed { reason }
            }
        }
    }

    /// Trains the live model on `histories` for `epochs` full-batch steps.
    /// Nothing is persisted.
    pub fn train_cycle(
        &self,
        histories: &Histories,
        epochs: usize,
        learning_rate: f64,
    ) -> Result<StageReport> {
        let _guard = self.status.try_begin().ok_or(ForecastError::Busy)?;
        let mut candidate = self.current_model()?;
        let report = self.fit_stage(
            &mut candidate,
            histories,
            TrainingStage {
                epochs,
                learning_rate,
            },
            "Training",
        )?;
        if report.windows > 0 {
            self.replace_model(candidate);
        }
        Ok(report)
    }

    /// Short, degenerate or non-positive input yields the all-zero sentinel,
    /// as does an untrained predictor.
    pub fn predict(&self, history: &[f64]) -> GrowthForecast {
        let horizons = &self.settings.horizons;
        let steps = horizons.max_offset().min(self.settings.rollout_steps);
        let curve = match self.forecast_curve(history, steps) {
            Ok(curve) => curve,
            Err(err) => {
                debug!("Returning sentinel forecast: {}", err);
                return GrowthForecast::sentinel(horizons);
            }
        };
        let last_price = history[history.len() - 1];

        horizons
            .iter()
            .map(|(key, offset)| {
                let growth = offset
                    .checked_sub(1)
                    .and_then(|idx| curve.get(idx))
                    .and_then(|predicted| growth_percent(*predicted, last_price))
                    .unwrap_or(0.0);
                (key.to_string(), growth)
            })
            .collect()
    }

    pub fn predict_many(&self, histories: &Histories) -> BTreeMap<String, GrowthForecast> {
        histories
            .iter()
            .map(|(ticker, history)| (ticker.clone(), self.predict(history)))
            .collect()
    }

    pub fn forecast_curve(&self, history: &[f64], steps: usize) -> Result<Vec<f64>, ForecastError> {
        let sequence_length = self.settings.sequence_length;
        if history.len() < sequence_length {
            return Err(ForecastError::DataInsufficient {
                len: history.len(),
                required: sequence_length,
            });
        }
        let last_price = history[history.len() - 1];
        if !last_price.is_finite() || last_price <= 0.0 {
            return Err(ForecastError::InvalidPrice { value: last_price });
        }
        let (values, scaler) = NormalizedWindow::from_tail(history, sequence_length)?.into_parts();

        let guard = self.model.read().unwrap_or_else(PoisonError::into_inner);
        let Some(model) = guard.as_ref() else {
            return Err(ForecastError::ModelUnavailable {
                model: "sequence".to_string(),
                reason: "no trained weights".to_string(),
            });
        };
        Ok(model
            .rollout(values, steps)
            .map(|scaled| scaler.denormalize(scaled))
            .collect())
    }

    fn run_cycle(
        &self,
        market: &dyn MarketDataSource,
        targets: &Histories,
    ) -> Result<(StageReport, StageReport)> {
        let cycle = self.settings.cycle;
        cycle.validate().context("Invalid training cycle")?;
        let mut candidate = self.current_model()?;

        self.status.set_phase(TrainingPhase::PreTraining);
        let corpus = self.fetch_market_corpus(market);
        info!(
            "Pre-training on {} market series ({} epochs, lr {})",
            corpus.len(),
            cycle.pretrain.epochs,
            cycle.pretrain.learning_rate
        );
        let pretrain = self
            .fit_stage(&mut candidate, &corpus, cycle.pretrain, "Pre-training")
            .context("Pre-training failed")?;

        self.status.set_phase(TrainingPhase::FineTuning);
        info!(
            "Fine-tuning on {} target series ({} epochs, lr {})",
            targets.len(),
            cycle.finetune.epochs,
            cycle.finetune.learning_rate
        );
        let finetune = self
            .fit_stage(&mut candidate, targets, cycle.finetune, "Fine-tuning")
            .context("Fine-tuning failed")?;
        if pretrain.windows == 0 && finetune.windows == 0 {
            return Err(anyhow!("No usable training windows in market or target series"));
        }

        self.status.set_phase(TrainingPhase::Persisting);
        self.save_weights(&candidate)?;
        self.replace_model(candidate);
        Ok((pretrain, finetune))
    }

    fn fetch_market_corpus(&self, market: &dyn MarketDataSource) -> Histories {
        let span = HistorySpan::years(self.settings.market_history_years);
        let mut corpus = Histories::new();
        for ticker in &self.settings.market_tickers {
            match market.close_history(ticker, span) {
                Ok(series) if series.len() > self.settings.min_market_history => {
                    corpus.insert(ticker.clone(), series);
                }
                Ok(series) => {
                    info!(
                        "Skipping {} for pre-training: only {} points",
                        ticker,
                        series.len()
                    );
                }
                Err(err) => {
                    warn!("Failed to fetch market history for {}: {:#}", ticker, err);
                }
            }
        }
        corpus
    }

    fn fit_stage(
        &self,
        model: &mut SequenceModel,
        histories: &Histories,
        stage: TrainingStage,
        label: &str,
    ) -> Result<StageReport> {
        let windows = build_training_windows(
            histories.values().map(Vec::as_slice),
            self.settings.sequence_length,
            self.settings.min_training_history,
        )?;
        if windows.is_empty() {
            info!("{}: no usable training windows; skipping", label);
            return Ok(StageReport {
                series_used: windows.series_used,
                series_skipped: windows.series_skipped,
                windows: 0,
                epochs: 0,
                final_loss: None,
            });
        }

        info!(
            "{}: {} windows from {} series ({} skipped) on {:?}",
            label,
            windows.len(),
            windows.series_used,
            windows.series_skipped,
            self.context
        );
        let progress = self.progress_bar(stage.epochs, label);
        let fit = model.fit(
            windows.inputs.view(),
            windows.targets.view(),
            stage.learning_rate,
            stage.epochs,
            &self.context,
            |epoch, loss| {
                progress.set_position(epoch as u64);
                progress.set_message(format!("loss {:.6}", loss));
                if epoch % 10 == 0 {
                    debug!("{} epoch {}/{} loss {:.6}", label, epoch, stage.epochs, loss);
                }
            },
        );
        let fit = match fit {
            Ok(fit) => fit,
            Err(err) => {
                progress.abandon_with_message("failed");
                return Err(err);
            }
        };
        progress.finish_with_message(format!(
            "{} done, loss {:.6}",
            label,
            fit.final_loss.unwrap_or(f64::NAN)
        ));

        Ok(StageReport {
            series_used: windows.series_used,
            series_skipped: windows.series_skipped,
            windows: fit.windows,
            epochs: fit.epochs,
            final_loss: fit.final_loss,
        })
    }

    fn progress_bar(&self, epochs: usize, label: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(epochs as u64);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ) {
            progress.set_style(style.progress_chars("#>-"));
        }
        progress.set_prefix(label.to_string());
        progress
    }

    fn save_weights(&self, model: &SequenceModel) -> Result<()> {
        let path = &self.settings.artifact_path;
        let artifact = WeightArtifactRef {
            version: WEIGHT_ARTIFACT_VERSION,
            saved_at: Utc::now(),
            sequence_length: self.settings.sequence_length,
            model,
        };
        write_atomically(path, |writer| {
            bincode::serialize_into(writer, &artifact).context("Failed to serialize weights")
        })
        .with_context(|| format!("Failed to persist weights to {}", path.display()))?;
        info!(
            "Saved {} parameters to {}",
            model.parameter_count(),
            path.display()
        );
        Ok(())
    }

    fn current_model(&self) -> Result<SequenceModel> {
        let live = self.model.read().unwrap_or_else(PoisonError::into_inner);
        match live.as_ref() {
            Some(model) => Ok(model.clone()),
            None => SequenceModel::new(self.settings.model),
        }
    }

    fn replace_model(&self, model: SequenceModel) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
    }
}

fn load_weights(path: &Path, settings: &PredictorSettings) -> Result<Option<SequenceModel>> {
    if !path.is_file() {
        return Ok(None);
    }
    let file = File::open(path)
        .with_context(|| format!("Failed to open weight artifact {}", path.display()))?;
    let artifact: WeightArtifact =
        bincode::deserialize_from(BufReader::new(file)).context("Weight artifact decode failed")?;
    if artifact.version != WEIGHT_ARTIFACT_VERSION {
        return Err(anyhow!(
            "Weight artifact version mismatch (found {}, expected {})",
            artifact.version,
            WEIGHT_ARTIFACT_VERSION
        ));
    }
    if artifact.sequence_length != settings.sequence_length {
        return Err(anyhow!(
            "Weight artifact was trained on {}-point windows, settings use {}",
            artifact.sequence_length,
            settings.sequence_length
        ));
    }
    artifact.model.validate()?;
    let stored = artifact.model.config();
    if stored.hidden_size != settings.model.hidden_size || stored.num_layers != settings.model.num_layers {
        return Err(anyhow!(
            "Weight artifact architecture {}x{} does not match settings {}x{}",
            stored.num_layers,
            stored.hidden_size,
            settings.model.num_layers,
            settings.model.hidden_size
        ));
    }
    info!(
        "Loaded weights from {} (saved {})",
        path.display(),
        artifact.saved_at.to_rfc3339()
    );
    Ok(Some(artifact.model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingCycle;
    use crate::sequence_model::SequenceModelConfig;
    use uuid::Uuid;

    fn settings(artifact: PathBuf) -> PredictorSettings {
        PredictorSettings {
            model: SequenceModelConfig {
                hidden_size: 4,
                num_layers: 1,
                dropout: 0.0,
                seed: Some(17),
            },
            cycle: TrainingCycle {
                pretrain: TrainingStage {
                    epochs: 2,
                    learning_rate: 0.01,
                },
                finetune: TrainingStage {
                    epochs: 1,
                    learning_rate: 0.005,
                },
            },
            artifact_path: artifact,
            ..PredictorSettings::default()
        }
    }

    fn predictor() -> TrainablePredictor {
        let path = std::env::temp_dir().join(format!("forecaster-unit-{}.bin", Uuid::new_v4()));
        TrainablePredictor::new(settings(path), ExecutionContext::cpu().expect("cpu")).expect("predictor")
    }

    fn sine_history(length: usize) -> Vec<f64> {
        (0..length).map(|idx| 50.0 + (idx as f64 / 5.0).sin()).collect()
    }

    fn trained(predictor: TrainablePredictor) -> TrainablePredictor {
        let mut histories = Histories::new();
        histories.insert("SINE".to_string(), sine_history(120));
        let report = predictor.train_cycle(&histories, 3, 0.01).expect("train");
        assert_eq!(report.windows, 60);
        predictor
    }

    #[test]
    fn untrained_predictor_serves_sentinel() {
        let predictor = predictor();
        assert!(!predictor.is_trained());
        let history: Vec<f64> = (0..300).map(|idx| 20.0 + (idx % 17) as f64).collect();

        let forecast = predictor.predict(&history);
        let entries: Vec<(&str, f64)> = forecast.iter().collect();
        assert_eq!(entries, vec![("1M", 0.0), ("1Y", 0.0), ("6M", 0.0)]);
        let err = predictor.forecast_curve(&history, 21).unwrap_err();
        assert!(matches!(err, ForecastError::ModelUnavailable { .. }), "{err}");
    }

    #[test]
    fn horizon_beyond_rollout_is_sentinel() {
        let path = std::env::temp_dir().join(format!("forecaster-unit-{}.bin", Uuid::new_v4()));
        let mut short_rollout = settings(path);
        short_rollout.rollout_steps = 100;
        let predictor = trained(
            TrainablePredictor::new(short_rollout, ExecutionContext::cpu().expect("cpu")).expect("predictor"),
        );

        let forecast = predictor.predict(&sine_history(90));
        assert_eq!(forecast.get("6M"), Some(0.0));
        assert_eq!(forecast.get("1Y"), Some(0.0));
        assert!(forecast.get("1M").unwrap().is_finite());
        assert_eq!(predictor.forecast_curve(&sine_history(90), 100).expect("curve").len(), 100);
    }

    #[test]
    fn non_positive_last_price_is_sentinel() {
        let predictor = trained(predictor());
        let mut history: Vec<f64> = (0..70).map(|idx| 10.0 + idx as f64).collect();
        *history.last_mut().unwrap() = 0.0;
        assert!(predictor.predict(&history).is_sentinel());

        let err = predictor.forecast_curve(&history, 5).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidPrice { value } if value == 0.0), "{err}");
        assert!(err.is_data_insufficient());
    }

    #[test]
    fn train_cycle_without_windows_is_noop() {
        let predictor = predictor();
        let history: Vec<f64> = (0..70).map(|idx| 10.0 + idx as f64).collect();
        let before = predictor.predict(&history);

        let mut histories = Histories::new();
        histories.insert("SHORT".to_string(), vec![1.0; 79]);
        let report = predictor.train_cycle(&histories, 5, 0.01).expect("no-op");
        assert_eq!(report.windows, 0);
        assert_eq!(report.series_skipped, 1);
        assert!(!predictor.is_trained());
        assert_eq!(predictor.predict(&history), before);
    }

    #[test]
    fn cycle_without_any_windows_fails_without_artifact() {
        let predictor = predictor();
        let market = crate::market_data::MarketDataSnapshot::new(Histories::new());
        let report = predictor.auto_train(&market, &Histories::new());
        assert!(matches!(report, TrainingReport::Failed { .. }), "{report:?}");
        assert!(!predictor.settings().artifact_path.exists());
        assert!(!predictor.is_trained());
    }

    #[test]
    fn train_cycle_rejected_while_busy() {
        let predictor = predictor();
        let _guard = predictor.status().try_begin().expect("claim");
        let err = predictor.train_cycle(&Histories::new(), 1, 0.01).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForecastError>(),
            Some(ForecastError::Busy)
        ));
    }
}
