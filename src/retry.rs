use anyhow::{anyhow, Result};
use std::thread;
use std::time::Duration;

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 10000;

/// Runs `operation` up to `MAX_RETRIES + 1` times with jittered exponential
/// backoff between attempts.
pub fn retry_with_backoff<F, T>(label: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry_with_delays(label, BASE_DELAY_MS, operation)
}

pub(crate) fn retry_with_delays<F, T>(label: &str, base_delay_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_error = None;

    for attempt in 0..=MAX_RETRIES {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < MAX_RETRIES {
                    let final_delay = backoff_delay_ms(base_delay_ms, attempt);
                    log::debug!(
                        "{} attempt {} failed ({}), retrying in {}ms",
                        label,
                        attempt + 1,
                        e,
                        final_delay
                    );
                    thread::sleep(Duration::from_millis(final_delay));
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("{} exhausted retry attempts", label)))
}

fn backoff_delay_ms(base_delay_ms: u64, attempt: usize) -> u64 {
    let delay_ms = base_delay_ms
        .saturating_mul(2_u64.saturating_pow(attempt as u32))
        .min(MAX_DELAY_MS);
    let jitter_range = (delay_ms as f64 * 0.25) as u64;
    let jitter = fastrand::u64(0..=jitter_range * 2);
    delay_ms.saturating_sub(jitter_range).saturating_add(jitter)
}
