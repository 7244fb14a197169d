use crate::config::{PointModelSettings, SamplingModelSettings};
use crate::context::ExecutionContext;
use crate::foundation::{
    LoadedModel, PointModelLoader, ResidencyMonitor, SamplingModelLoader,
};
use crate::models::HorizonTable;
use crate::predictor::TrainablePredictor;
use crate::window::{elementwise_median, tail};
use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use std::fmt::Write;

pub const SYNTHETIC_LENGTH: usize = 1500;
pub const CONTEXT_LENGTH: usize = 1000;
pub const TRUTH_LENGTH: usize = 252;
pub const SAMPLING_CONTEXT_LENGTH: usize = 512;

/// `100 + 0.05 t + 10 sin(t / 20) + N(0, 0.5)`
pub fn synthetic_series(length: usize, seed: u64) -> Result<Vec<f64>> {
    let noise = Normal::new(0.0, 0.5).map_err(|err| anyhow!("Invalid noise distribution: {}", err))?;
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..length)
        .map(|t| {
            let t = t as f64;
            100.0 + 0.05 * t + 10.0 * (t / 20.0).sin() + rng.sample(noise)
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct HorizonAccuracy {
    pub horizon: String,
    pub offset: usize,
    pub points: usize,
    pub mape: f64,
    pub mae: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyReport {
    pub model: String,
    pub rows: Vec<HorizonAccuracy>,
    pub error: Option<String>,
}

impl AccuracyReport {
    fn failed(model: &str, err: anyhow::Error) -> Self {
        log::warn!("Evaluation of {} failed: {:#}", model, err);
        Self {
            model: model.to_string(),
            rows: Vec::new(),
            error: Some(format!("{:#}", err)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    context: Vec<f64>,
    truth: Vec<f64>,
    horizons: HorizonTable,
}

impl Evaluation {
    pub fn new(series: &[f64], context_length: usize, truth_length: usize, horizons: HorizonTable) -> Result<Self> {
        if context_length == 0 || truth_length == 0 {
            return Err(anyhow!("Context and truth lengths must be positive"));
        }
        if series.len() < context_length + truth_length {
            return Err(anyhow!(
                "Series of {} points cannot supply {} context and {} truth points",
                series.len(),
                context_length,
                truth_length
            ));
        }
        Ok(Self {
            context: series[..context_length].to_vec(),
            truth: series[context_length..context_length + truth_length].to_vec(),
            horizons,
        })
    }

    pub fn synthetic(seed: u64) -> Result<Self> {
        let series = synthetic_series(SYNTHETIC_LENGTH, seed)?;
        Self::new(
            &series,
            CONTEXT_LENGTH,
            TRUTH_LENGTH,
            HorizonTable::evaluation_default(),
        )
    }

    pub fn context(&self) -> &[f64] {
        &self.context
    }

    pub fn truth(&self) -> &[f64] {
        &self.truth
    }

    pub fn score(&self, model: &str, curve: &[f64]) -> AccuracyReport {
        let rows = self
            .horizons
            .iter()
            .filter_map(|(key, offset)| {
                let points = offset.min(curve.len()).min(self.truth.len());
                if points == 0 {
                    return None;
                }
                let (abs_sum, pct_sum) = curve[..points]
                    .iter()
                    .zip(&self.truth[..points])
                    .fold((0.0, 0.0), |(abs_sum, pct_sum), (predicted, actual)| {
                        let error = (predicted - actual).abs();
                        (abs_sum + error, pct_sum + error / actual.abs())
                    });
                Some(HorizonAccuracy {
                    horizon: key.to_string(),
                    offset,
                    points,
                    mape: pct_sum / points as f64 * 100.0,
                    mae: abs_sum / points as f64,
                })
            })
            .collect();
        AccuracyReport {
            model: model.to_string(),
            rows,
            error: None,
        }
    }

    pub fn evaluate_predictor(&self, name: &str, predictor: &TrainablePredictor) -> AccuracyReport {
        match predictor.forecast_curve(&self.context, self.truth.len()) {
            Ok(curve) => self.score(name, &curve),
            Err(err) => AccuracyReport::failed(name, err.into()),
        }
    }

    pub fn evaluate_point_model(
        &self,
        settings: &PointModelSettings,
        loader: &dyn PointModelLoader,
        context: &ExecutionContext,
        monitor: &ResidencyMonitor,
    ) -> AccuracyReport {
        let name = settings.name.as_str();
        let result = (|| -> Result<Vec<f64>> {
            let mut model = LoadedModel::new(name, loader.load(name, context)?, monitor.enter());
            let horizon = self.truth.len().min(settings.max_horizon);
            model
                .forecast(tail(&self.context, settings.max_context), horizon)?
                .into_curve()
        })();
        match result {
            Ok(curve) => self.score(name, &curve),
            Err(err) => AccuracyReport::failed(name, err),
        }
    }

    pub fn evaluate_sampling_model(
        &self,
        settings: &SamplingModelSettings,
        loader: &dyn SamplingModelLoader,
        monitor: &ResidencyMonitor,
    ) -> AccuracyReport {
        let name = settings.name.as_str();
        let result = (|| -> Result<Vec<f64>> {
            let context = ExecutionContext::cpu()?;
            let mut model = LoadedModel::new(name, loader.load(name, &context)?, monitor.enter());
            let samples = model.sample(
                tail(&self.context, SAMPLING_CONTEXT_LENGTH),
                self.truth.len(),
                settings.num_samples,
            )?;
            Ok(elementwise_median(&samples))
        })();
        match result {
            Ok(curve) => self.score(name, &curve),
            Err(err) => AccuracyReport::failed(name, err),
        }
    }
}

pub fn render_table(reports: &[AccuracyReport]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:>8} {:>8} {:>10} {:>10}",
        "Model", "Horizon", "Points", "MAPE %", "MAE"
    );
    let _ = writeln!(out, "{}", "-".repeat(52));
    for report in reports {
        if let Some(error) = &report.error {
            let _ = writeln!(out, "{:<12} unavailable: {}", report.model, error);
            continue;
        }
        for row in &report.rows {
            let _ = writeln!(
                out,
                "{:<12} {:>8} {:>8} {:>10.3} {:>10.4}",
                report.model, row.horizon, row.points, row.mape, row.mae
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::SampleForecaster;
    use std::sync::{Arc, Mutex};

    struct RecordingSampler {
        contexts: Arc<Mutex<Vec<usize>>>,
    }

    impl SampleForecaster for RecordingSampler {
        fn sample(
            &mut self,
            context: &[f64],
            prediction_length: usize,
            num_samples: usize,
        ) -> Result<Vec<Vec<f64>>> {
            self.contexts.lock().unwrap().push(context.len());
            Ok(vec![vec![context[context.len() - 1]; prediction_length]; num_samples])
        }
    }

    struct RecordingLoader {
        contexts: Arc<Mutex<Vec<usize>>>,
    }

    impl SamplingModelLoader for RecordingLoader {
        fn load(&self, _: &str, _: &ExecutionContext) -> Result<Box<dyn SampleForecaster>> {
            Ok(Box::new(RecordingSampler {
                contexts: Arc::clone(&self.contexts),
            }))
        }
    }

    #[test]
    fn synthetic_series_is_seeded() {
        let first = synthetic_series(50, 9).expect("series");
        let second = synthetic_series(50, 9).expect("series");
        assert_eq!(first, second);
        assert!((first[0] - 100.0).abs() < 3.0);
    }

    #[test]
    fn score_uses_curve_prefixes() {
        let series: Vec<f64> = (0..30).map(|idx| 100.0 + idx as f64).collect();
        let horizons = HorizonTable::new(vec![("1d", 1), ("1w", 5), ("long", 50)]).expect("table");
        let evaluation = Evaluation::new(&series, 20, 10, horizons).expect("split");
        assert_eq!(evaluation.truth()[0], 120.0);

        let curve: Vec<f64> = evaluation.truth().iter().map(|value| value + 2.0).collect();
        let report = evaluation.score("shifted", &curve[..8]);
        assert_eq!(report.rows.len(), 3);
        assert!((report.rows[0].mae - 2.0).abs() < 1e-12);
        assert!((report.rows[0].mape - 2.0 / 120.0 * 100.0).abs() < 1e-9);
        assert_eq!(report.rows[1].points, 5);
        assert_eq!(report.rows[2].points, 8);

        let table = render_table(&[report]);
        assert!(table.contains("shifted"));
        assert_eq!(table.lines().count(), 5);
    }

    #[test]
    fn sampling_evaluation_feeds_last_512_points() {
        let evaluation = Evaluation::synthetic(3).expect("synthetic");
        let contexts = Arc::new(Mutex::new(Vec::new()));
        let loader = RecordingLoader {
            contexts: Arc::clone(&contexts),
        };
        let monitor = ResidencyMonitor::new();

        let report = evaluation.evaluate_sampling_model(&SamplingModelSettings::default(), &loader, &monitor);
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.rows.len(), HorizonTable::evaluation_default().len());
        assert_eq!(*contexts.lock().unwrap(), vec![SAMPLING_CONTEXT_LENGTH]);
        assert_eq!(monitor.current(), 0);
    }

    #[test]
    fn short_series_is_rejected() {
        let horizons = HorizonTable::evaluation_default();
        assert!(Evaluation::new(&[1.0; 100], 90, 20, horizons).is_err());
    }
}
