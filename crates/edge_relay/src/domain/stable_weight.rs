use common::domain::{CaptureDevice, DomainResult};
use std::time::Duration;
use tracing::{debug, warn};

/// How many raw scale readings to take and how far apart they may be
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Largest accepted spread (max - min) across the readings, in kg
    pub threshold_kg: f64,
    pub max_readings: usize,
    /// Pause between two raw readings
    pub sample_interval: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            threshold_kg: 0.5,
            max_readings: 5,
            sample_interval: Duration::from_millis(200),
        }
    }
}

/// Mean of the readings when they are stable, `None` otherwise.
///
/// Readings are stable when every one is finite and max - min stays within
/// `threshold_kg`.
pub fn stable_mean(readings: &[f64], threshold_kg: f64) -> Option<f64> {
    if readings.is_empty() || readings.iter().any(|r| !r.is_finite()) {
        return None;
    }

    let min = readings.iter().copied().fold(f64::INFINITY, f64::min);
    let max = readings.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let spread = max - min;

    if spread > threshold_kg {
        warn!(
            spread_kg = spread,
            threshold_kg,
            readings = readings.len(),
            "weight readings unstable, omitting weight"
        );
        return None;
    }

    Some(readings.iter().sum::<f64>() / readings.len() as f64)
}

/// Take `max_readings` raw readings from the scale and average them if stable.
///
/// Unstable readings yield `Ok(None)`; only a device failure is an error.
pub async fn read_stable_weight(
    device: &dyn CaptureDevice,
    config: &StabilityConfig,
) -> DomainResult<Option<f64>> {
    let count = config.max_readings.max(1);
    let mut readings = Vec::with_capacity(count);

    for i in 0..count {
        if i > 0 && !config.sample_interval.is_zero() {
            tokio::time::sleep(config.sample_interval).await;
        }
        readings.push(device.read_weight().await?);
    }

    let weight = stable_mean(&readings, config.threshold_kg);
    debug!(readings = ?readings, weight = ?weight, "scale sampled");
    Ok(weight)
}
