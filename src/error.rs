use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("insufficient history: {len} points, at least {required} required")]
    DataInsufficient { len: usize, required: usize },

    #[error("degenerate price range (min == max == {value})")]
    DegenerateRange { value: f64 },

    #[error("unusable last price {value}")]
    InvalidPrice { value: f64 },

    #[error("model {model} unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("inference failed for {ticker}: {reason}")]
    InstrumentFailure { ticker: String, reason: String },

    #[error("training failed: {0}")]
    TrainingFailure(String),

    #[error("a training cycle is already running")]
    Busy,
}

impl ForecastError {
    pub fn is_data_insufficient(&self) -> bool {
        matches!(
            self,
            ForecastError::DataInsufficient { .. }
                | ForecastError::DegenerateRange { .. }
                | ForecastError::InvalidPrice { .. }
        )
    }
}
