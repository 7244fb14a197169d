use crate::error::ForecastError;
use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2};
use statrs::statistics::{Data, Median};

pub const DEFAULT_SEQUENCE_LENGTH: usize = 60;

/// Linear rescale to [0, 1] by a fitted minimum and maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMaxScaler {
    min: f64,
    max: f64,
}

impl MinMaxScaler {
    pub fn fit(values: &[f64]) -> Result<Self, ForecastError> {
        if values.is_empty() {
            return Err(ForecastError::DataInsufficient {
                len: 0,
                required: 1,
            });
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        if !range.is_finite() || range <= 0.0 {
            return Err(ForecastError::DegenerateRange { value: min });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    pub fn normalize(&self, value: f64) -> f64 {
        (value - self.min) / self.range()
    }

    pub fn denormalize(&self, scaled: f64) -> f64 {
        scaled * self.range() + self.min
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|value| self.normalize(*value)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedWindow {
    values: Vec<f64>,
    scaler: MinMaxScaler,
}

impl NormalizedWindow {
    pub fn from_tail(history: &[f64], length: usize) -> Result<Self, ForecastError> {
        if length == 0 || history.len() < length {
            return Err(ForecastError::DataInsufficient {
                len: history.len(),
                required: length.max(1),
            });
        }
        let slice = tail(history, length);
        let scaler = MinMaxScaler::fit(slice)?;
        Ok(Self {
            values: scaler.transform(slice),
            scaler,
        })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn scaler(&self) -> MinMaxScaler {
        self.scaler
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_parts(self) -> (Vec<f64>, MinMaxScaler) {
        (self.values, self.scaler)
    }
}

#[derive(Debug, Clone)]
pub struct TrainingWindows {
    /// `[window_count, sequence_length]`
    pub inputs: Array2<f64>,
    pub targets: Array1<f64>,
    pub series_used: usize,
    pub series_skipped: usize,
}

impl TrainingWindows {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Every window of `sequence_length` with the following point as target.
pub fn build_training_windows<'a, I>(
    histories: I,
    sequence_length: usize,
    min_history: usize,
) -> Result<TrainingWindows>
where
    I: IntoIterator<Item = &'a [f64]>,
{
    if sequence_length == 0 {
        return Err(anyhow!("Sequence length must be positive"));
    }
    let min_history = min_history.max(sequence_length + 1);
    let mut flat_inputs = Vec::new();
    let mut targets = Vec::new();
    let mut series_used = 0usize;
    let mut series_skipped = 0usize;

    for history in histories {
        if history.len() < min_history || history.iter().any(|value| !value.is_finite()) {
            series_skipped += 1;
            continue;
        }
        let Ok(scaler) = MinMaxScaler::fit(history) else {
            series_skipped += 1;
            continue;
        };
        let scaled = scaler.transform(history);
        for start in 0..scaled.len() - sequence_length {
            flat_inputs.extend_from_slice(&scaled[start..start + sequence_length]);
            targets.push(scaled[start + sequence_length]);
        }
        series_used += 1;
    }

    let inputs = Array2::from_shape_vec((targets.len(), sequence_length), flat_inputs)
        .map_err(|err| anyhow!("Failed to shape training windows: {}", err))?;
    Ok(TrainingWindows {
        inputs,
        targets: Array1::from(targets),
        series_used,
        series_skipped,
    })
}

pub fn tail(values: &[f64], length: usize) -> &[f64] {
    &values[values.len().saturating_sub(length)..]
}

/// Every `stride`-th point counted back from the last observation, returned
/// in chronological order. The last observation is always kept.
pub fn resample_stride(history: &[f64], stride: usize) -> Vec<f64> {
    if stride <= 1 {
        return history.to_vec();
    }
    let mut sampled: Vec<f64> = history.iter().rev().step_by(stride).copied().collect();
    sampled.reverse();
    sampled
}

pub fn elementwise_median(samples: &[Vec<f64>]) -> Vec<f64> {
    let steps = samples.iter().map(Vec::len).min().unwrap_or(0);
    (0..steps)
        .map(|step| {
            let column: Vec<f64> = samples
                .iter()
                .map(|trajectory| trajectory[step])
                .filter(|value| value.is_finite())
                .collect();
            if column.is_empty() {
                f64::NAN
            } else {
                Data::new(column).median()
            }
        })
        .collect()
}
