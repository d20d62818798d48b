use rand::Rng;
use std::{collections::BTreeSet, time::Duration};

use super::traits::FallbackSource;

/// Smooth synthetic drive signals for offline operation
///
/// Speed and torque follow phase-shifted sine waves, current toggles between two
/// load levels, and the temperature and monitor registers carry small random noise.
#[derive(Debug, Clone)]
pub struct WaveformSource {
    noise: bool,
}

impl WaveformSource {
    pub fn new() -> Self {
        Self { noise: true }
    }

    /// Deterministic output, for tests
    pub fn without_noise() -> Self {
        Self { noise: false }
    }

    fn jitter(&self, amplitude: f64) -> f64 {
        if self.noise {
            rand::rng().random_range(-amplitude..=amplitude)
        } else {
            0.0
        }
    }

    fn value(&self, code: &str, t: f64) -> Option<f64> {
        let torque = 800.0 * (1.5 * t).cos();
        let value = match code {
            "P0B-00" => 500.0 * (1.5 * t).sin(),
            "P0B-01" => {
                if t % 4.0 < 2.0 {
                    1500.0
                } else {
                    1000.0
                }
            }
            "P0B-02" => torque,
            "P0B-15" => self.jitter(10.0),
            // unsigned register
            "P0B-24" => ((torque * 0.75).abs() + self.jitter(5.0)).max(0.0),
            "P0B-58" => 1.0e6 * (t / 10.0).sin() + 2.0e6,
            _ => return None,
        };
        Some(value)
    }
}

impl Default for WaveformSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackSource for WaveformSource {
    fn generate(&mut self, elapsed: Duration, visible: &BTreeSet<String>) -> Vec<(String, i64)> {
        let t = elapsed.as_secs_f64();
        visible
            .iter()
            .filter_map(|code| {
                self.value(code, t)
                    .map(|value| (code.clone(), value.round() as i64))
            })
            .collect()
    }
}
