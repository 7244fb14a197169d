use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingPhase {
    #[default]
    Idle,
    PreTraining,
    FineTuning,
    Persisting,
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrainingPhase::Idle => "Idle",
            TrainingPhase::PreTraining => "Pre-training",
            TrainingPhase::FineTuning => "Fine-tuning",
            TrainingPhase::Persisting => "Persisting",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Default)]
pub struct TrainingStatus {
    busy: Arc<AtomicBool>,
    inner: Arc<Mutex<TrainingStatusData>>,
}

#[derive(Default)]
struct TrainingStatusData {
    phase: TrainingPhase,
    last_trained_at: Option<DateTime<Utc>>,
    last_loss: Option<f64>,
    last_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TrainingStatusSnapshot {
    pub busy: bool,
    pub phase: TrainingPhase,
    pub last_trained_at: Option<DateTime<Utc>>,
    pub last_loss: Option<f64>,
    pub last_error: Option<String>,
}

impl TrainingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the busy flag, or `None` if another cycle holds it.
    pub fn try_begin(&self) -> Option<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                status: self.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_phase(&self, phase: TrainingPhase) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase;
        }
    }

    pub fn record_success(&self, loss: Option<f64>) {
        if let Ok(mut data) = self.inner.lock() {
            data.last_trained_at = Some(Utc::now());
            data.last_loss = loss;
            data.last_error = None;
        }
    }

    pub fn record_failure<S: Into<String>>(&self, reason: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.last_error = Some(reason.into());
        }
    }

    pub fn snapshot(&self) -> TrainingStatusSnapshot {
        let busy = self.is_busy();
        if let Ok(data) = self.inner.lock() {
            TrainingStatusSnapshot {
                busy,
                phase: data.phase,
                last_trained_at: data.last_trained_at,
                last_loss: data.last_loss,
                last_error: data.last_error.clone(),
            }
        } else {
            TrainingStatusSnapshot {
                busy,
                phase: TrainingPhase::Idle,
                last_trained_at: None,
                last_loss: None,
                last_error: Some("Status unavailable".to_string()),
            }
        }
    }
}

pub struct BusyGuard {
    status: TrainingStatus,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.status.set_phase(TrainingPhase::Idle);
        self.status.busy.store(false, Ordering::Release);
    }
}
