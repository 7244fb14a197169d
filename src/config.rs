use crate::models::HorizonTable;
use crate::sequence_model::SequenceModelConfig;
use crate::window::DEFAULT_SEQUENCE_LENGTH;
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_MARKET_TICKERS: [&str; 10] = [
    "SPY", "QQQ", "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "BRK-B", "LLY", "JPM",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingStage {
    pub epochs: usize,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingCycle {
    pub pretrain: TrainingStage,
    pub finetune: TrainingStage,
}

impl Default for TrainingCycle {
    fn default() -> Self {
        Self {
            pretrain: TrainingStage {
                epochs: 30,
                learning_rate: 0.005,
            },
            finetune: TrainingStage {
                epochs: 20,
                learning_rate: 0.001,
            },
        }
    }
}

impl TrainingCycle {
    pub fn validate(&self) -> Result<()> {
        for (label, stage) in [("pretrain", self.pretrain), ("finetune", self.finetune)] {
            if stage.epochs == 0 {
                return Err(anyhow!("{} epochs must be positive", label));
            }
            if !stage.learning_rate.is_finite() || stage.learning_rate <= 0.0 {
                return Err(anyhow!(
                    "{} learning rate must be positive (value: {})",
                    label,
                    stage.learning_rate
                ));
            }
        }
        if self.finetune.learning_rate >= self.pretrain.learning_rate {
            return Err(anyhow!(
                "FINETUNE_LEARNING_RATE ({}) must be lower than PRETRAIN_LEARNING_RATE ({})",
                self.finetune.learning_rate,
                self.pretrain.learning_rate
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PredictorSettings {
    pub sequence_length: usize,
    pub min_training_history: usize,
    pub rollout_steps: usize,
    pub horizons: HorizonTable,
    pub cycle: TrainingCycle,
    pub market_tickers: Vec<String>,
    pub market_history_years: usize,
    /// Market series must be strictly longer than this to be used.
    pub min_market_history: usize,
    pub model: SequenceModelConfig,
    pub artifact_path: PathBuf,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
            min_training_history: 80,
            rollout_steps: 252,
            horizons: HorizonTable::predictor_default(),
            cycle: TrainingCycle::default(),
            market_tickers: DEFAULT_MARKET_TICKERS.iter().map(|t| t.to_string()).collect(),
            market_history_years: 10,
            min_market_history: 200,
            model: SequenceModelConfig::default(),
            artifact_path: PathBuf::from("data/sequence_model.bin"),
        }
    }
}

impl PredictorSettings {
    pub fn validate(&self) -> Result<()> {
        self.validate_layout()?;
        self.cycle.validate()
    }

    pub fn validate_layout(&self) -> Result<()> {
        if self.sequence_length < 2 {
            return Err(anyhow!("SEQUENCE_LENGTH must be >= 2"));
        }
        if self.min_training_history <= self.sequence_length {
            return Err(anyhow!(
                "MIN_TRAINING_HISTORY ({}) must exceed SEQUENCE_LENGTH ({})",
                self.min_training_history,
                self.sequence_length
            ));
        }
        if self.rollout_steps == 0 {
            return Err(anyhow!("ROLLOUT_STEPS must be positive"));
        }
        self.model.validate()
    }
}

#[derive(Debug, Clone)]
pub struct PointModelSettings {
    pub name: String,
    pub max_context: usize,
    pub max_horizon: usize,
}

impl Default for PointModelSettings {
    fn default() -> Self {
        Self {
            name: "timesfm".to_string(),
            max_context: 512,
            max_horizon: 252,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamplingModelSettings {
    pub name: String,
    pub context: usize,
    pub daily_length: usize,
    pub weekly_length: usize,
    pub num_samples: usize,
    pub weekly_stride: usize,
    pub weekly_index: HorizonTable,
}

impl Default for SamplingModelSettings {
    fn default() -> Self {
        Self {
            name: "chronos".to_string(),
            context: 128,
            daily_length: 24,
            weekly_length: 54,
            num_samples: 20,
            weekly_stride: 5,
            weekly_index: HorizonTable::weekly_index_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FoundationSettings {
    pub min_history: usize,
    pub horizons: HorizonTable,
    pub point: PointModelSettings,
    pub sampling: SamplingModelSettings,
    pub model_host_url: Option<String>,
}

impl Default for FoundationSettings {
    fn default() -> Self {
        Self {
            min_history: 30,
            horizons: HorizonTable::orchestrator_default(),
            point: PointModelSettings::default(),
            sampling: SamplingModelSettings::default(),
            model_host_url: None,
        }
    }
}

impl FoundationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.min_history == 0 {
            return Err(anyhow!("MIN_FOUNDATION_HISTORY must be positive"));
        }
        if self.point.name == self.sampling.name {
            return Err(anyhow!(
                "POINT_MODEL_NAME and SAMPLING_MODEL_NAME must differ (both {})",
                self.point.name
            ));
        }
        let sampling = &self.sampling;
        if let Some(idx) = sampling.weekly_index.iter().map(|(_, idx)| idx).max() {
            if idx >= sampling.weekly_length {
                return Err(anyhow!(
                    "WEEKLY_HORIZON_INDEX entry {} is outside SAMPLING_WEEKLY_LENGTH ({})",
                    idx,
                    sampling.weekly_length
                ));
            }
        }
        for (key, _) in sampling.weekly_index.iter() {
            if self.horizons.get(key).is_none() {
                return Err(anyhow!(
                    "WEEKLY_HORIZON_INDEX key {} is not a forecast horizon",
                    key
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForecastSettings {
    pub predictor: PredictorSettings,
    pub foundation: FoundationSettings,
    pub execution_device: Option<String>,
    pub worker_threads: Option<usize>,
}

impl ForecastSettings {
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = PredictorSettings::default();
        let default_model = defaults.model;

        let predictor = PredictorSettings {
            sequence_length: setting_usize(settings, "SEQUENCE_LENGTH", defaults.sequence_length, 2)?,
            min_training_history: setting_usize(
                settings,
                "MIN_TRAINING_HISTORY",
                defaults.min_training_history,
                3,
            )?,
            rollout_steps: setting_usize(settings, "ROLLOUT_STEPS", defaults.rollout_steps, 1)?,
            horizons: defaults.horizons.clone(),
            cycle: TrainingCycle {
                pretrain: TrainingStage {
                    epochs: setting_usize(
                        settings,
                        "PRETRAIN_EPOCHS",
                        defaults.cycle.pretrain.epochs,
                        1,
                    )?,
                    learning_rate: setting_f64(
                        settings,
                        "PRETRAIN_LEARNING_RATE",
                        defaults.cycle.pretrain.learning_rate,
                        Some(f64::MIN_POSITIVE),
                        Some(1.0),
                    )?,
                },
                finetune: TrainingStage {
                    epochs: setting_usize(
                        settings,
                        "FINETUNE_EPOCHS",
                        defaults.cycle.finetune.epochs,
                        1,
                    )?,
                    learning_rate: setting_f64(
                        settings,
                        "FINETUNE_LEARNING_RATE",
                        defaults.cycle.finetune.learning_rate,
                        Some(f64::MIN_POSITIVE),
                        Some(1.0),
                    )?,
                },
            },
            market_tickers: match optional_setting(settings, "MARKET_TICKERS") {
                Some(raw) => parse_string_list(raw, "MARKET_TICKERS")?,
                None => defaults.market_tickers.clone(),
            },
            market_history_years: setting_usize(
                settings,
                "MARKET_HISTORY_YEARS",
                defaults.market_history_years,
                1,
            )?,
            min_market_history: setting_usize(
                settings,
                "MIN_MARKET_HISTORY",
                defaults.min_market_history,
                1,
            )?,
            model: SequenceModelConfig {
                hidden_size: setting_usize(settings, "HIDDEN_SIZE", default_model.hidden_size, 1)?,
                num_layers: setting_usize(settings, "NUM_LAYERS", default_model.num_layers, 1)?,
                dropout: setting_f64(
                    settings,
                    "DROPOUT",
                    default_model.dropout,
                    Some(0.0),
                    Some(0.95),
                )?,
                seed: match optional_setting(settings, "MODEL_SEED") {
                    Some(raw) => Some(
                        raw.parse::<u64>()
                            .map_err(|_| anyhow!("Setting MODEL_SEED must be an integer (value: {})", raw))?,
                    ),
                    None => None,
                },
            },
            artifact_path: optional_setting(settings, "MODEL_ARTIFACT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_path),
        };
        predictor
            .validate()
            .context("Invalid trainable predictor settings")?;

        let point_defaults = PointModelSettings::default();
        let sampling_defaults = SamplingModelSettings::default();
        let foundation = FoundationSettings {
            min_history: setting_usize(settings, "MIN_FOUNDATION_HISTORY", 30, 1)?,
            horizons: HorizonTable::orchestrator_default(),
            point: PointModelSettings {
                name: optional_setting(settings, "POINT_MODEL_NAME")
                    .map(str::to_string)
                    .unwrap_or(point_defaults.name),
                max_context: setting_usize(
                    settings,
                    "POINT_MAX_CONTEXT",
                    point_defaults.max_context,
                    1,
                )?,
                max_horizon: setting_usize(
                    settings,
                    "POINT_MAX_HORIZON",
                    point_defaults.max_horizon,
                    1,
                )?,
            },
            sampling: SamplingModelSettings {
                name: optional_setting(settings, "SAMPLING_MODEL_NAME")
                    .map(str::to_string)
                    .unwrap_or(sampling_defaults.name),
                context: setting_usize(settings, "SAMPLING_CONTEXT", sampling_defaults.context, 1)?,
                daily_length: setting_usize(
                    settings,
                    "SAMPLING_DAILY_LENGTH",
                    sampling_defaults.daily_length,
                    1,
                )?,
                weekly_length: setting_usize(
                    settings,
                    "SAMPLING_WEEKLY_LENGTH",
                    sampling_defaults.weekly_length,
                    1,
                )?,
                num_samples: setting_usize(
                    settings,
                    "SAMPLING_NUM_SAMPLES",
                    sampling_defaults.num_samples,
                    1,
                )?,
                weekly_stride: setting_usize(
                    settings,
                    "WEEKLY_STRIDE",
                    sampling_defaults.weekly_stride,
                    1,
                )?,
                weekly_index: match optional_setting(settings, "WEEKLY_HORIZON_INDEX") {
                    Some(raw) => HorizonTable::parse(raw)
                        .with_context(|| format!("Setting WEEKLY_HORIZON_INDEX is invalid (value: {})", raw))?,
                    None => sampling_defaults.weekly_index,
                },
            },
            model_host_url: optional_setting(settings, "MODEL_HOST_URL").map(str::to_string),
        };
        foundation
            .validate()
            .context("Invalid foundation model settings")?;

        let worker_threads = match optional_setting(settings, "WORKER_THREADS") {
            Some(_) => Some(setting_usize(settings, "WORKER_THREADS", 1, 1)?),
            None => None,
        };

        Ok(Self {
            predictor,
            foundation,
            execution_device: optional_setting(settings, "EXECUTION_DEVICE").map(str::to_string),
            worker_threads,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    if optional_setting(settings, key).is_none() {
        return Ok(default);
    }
    require_setting_f64(settings, key, min, max)
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    if optional_setting(settings, key).is_none() {
        return Ok(default);
    }
    require_setting_usize(settings, key, min)
}

fn require_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<usize> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn parse_string_list(raw: &str, key: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim().trim_matches(|c| c == '[' || c == ']');
    let values: Vec<String> = trimmed
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|part| part.trim().trim_matches('"'))
        .filter(|part| !part.is_empty())
        .map(|part| part.to_ascii_uppercase())
        .collect();
    if values.is_empty() {
        return Err(anyhow!(
            "Setting {} must contain at least one entry (value: {})",
            key,
            raw
        ));
    }
    Ok(values)
}
