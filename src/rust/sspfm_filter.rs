use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::sspfm_error::{SspfmError, SspfmResult};

closed_enum! {
    /// Filter applied to amplitude and phase before reduction.
    FilterType, "filter type" {
        NoFilter => "None",
        Mean => "mean",
        Low => "low",
        High => "high",
        Bandpass => "bandpass",
        Bandstop => "bandstop",
    }
}

impl Default for FilterType {
    fn default() -> Self {
        FilterType::NoFilter
    }
}

/// `filter {type, freq1, freq2, order}` block of the stage-1 configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    #[serde(rename = "type")]
    pub kind: FilterType,
    pub freq1: f64,
    pub freq2: f64,
    pub order: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig { kind: FilterType::NoFilter, freq1: 1e3, freq2: 3e3, order: 4 }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> SspfmResult<()> {
        match self.kind {
            FilterType::NoFilter => Ok(()),
            FilterType::Mean => {
                if self.order == 0 {
                    Err(SspfmError::config("filter order", "0", &[">= 1"]))
                } else {
                    Ok(())
                }
            }
            FilterType::Low | FilterType::High => {
                if self.freq1 > 0.0 && self.order > 0 {
                    Ok(())
                } else {
                    Err(SspfmError::config("filter freq1", &self.freq1.to_string(), &["> 0"]))
                }
            }
            FilterType::Bandpass | FilterType::Bandstop => {
                if self.freq1 > 0.0 && self.freq2 > self.freq1 && self.order > 0 {
                    Ok(())
                } else {
                    Err(SspfmError::config(
                        "filter freq1/freq2",
                        &format!("{}/{}", self.freq1, self.freq2),
                        &["0 < freq1 < freq2"],
                    ))
                }
            }
        }
    }

    /// Filters `values` sampled at `times` (s). Short windows pass through.
    pub fn apply(&self, values: &[f64], times: &[f64]) -> Vec<f64> {
        match self.kind {
            FilterType::NoFilter => values.to_vec(),
            FilterType::Mean => moving_average(values, self.order as usize),
            _ => {
                if values.len() < 4 || times.len() != values.len() {
                    return values.to_vec();
                }
                let span = times[times.len() - 1] - times[0];
                if !(span > 0.0) {
                    return values.to_vec();
                }
                let fs = (times.len() - 1) as f64 / span;
                butterworth_zero_phase(values, fs, self)
            }
        }
    }
}

/// Centred moving average; edges average over the samples available.
pub fn moving_average(values: &[f64], order: usize) -> Vec<f64> {
    let n = values.len();
    if order <= 1 || n == 0 {
        return values.to_vec();
    }
    let half_left = (order - 1) / 2;
    let half_right = order - 1 - half_left;
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half_left);
            let hi = (i + half_right).min(n - 1);
            values[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64
        })
        .collect()
}

fn low_gain(f: f64, fc: f64, order: u32) -> f64 {
    1.0 / (1.0 + (f / fc).powi(2 * order as i32))
}

fn high_gain(f: f64, fc: f64, order: u32) -> f64 {
    if f == 0.0 {
        return 0.0;
    }
    let r = (f / fc).powi(2 * order as i32);
    r / (1.0 + r)
}

/// Forward-backward Butterworth response applied in the frequency domain.
///
/// The gain is the squared Butterworth magnitude, i.e. the response of the
/// filter run once forward and once backward, so no phase is introduced.
fn butterworth_zero_phase(values: &[f64], fs: f64, config: &FilterConfig) -> Vec<f64> {
    let n = values.len();
    let mut buffer: Vec<Complex<f64>> = values.iter().map(|&v| Complex::new(v, 0.0)).collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(n).process(&mut buffer);

    for (k, bin) in buffer.iter_mut().enumerate() {
        let k_sym = if k <= n / 2 { k } else { n - k };
        let f = k_sym as f64 * fs / n as f64;
        let gain = match config.kind {
            FilterType::Low => low_gain(f, config.freq1, config.order),
            FilterType::High => high_gain(f, config.freq1, config.order),
            FilterType::Bandpass => {
                high_gain(f, config.freq1, config.order) * low_gain(f, config.freq2, config.order)
            }
            FilterType::Bandstop => {
                low_gain(f, config.freq1, config.order) + high_gain(f, config.freq2, config.order)
            }
            FilterType::NoFilter | FilterType::Mean => 1.0,
        };
        *bin *= gain;
    }

    planner.plan_fft_inverse(n).process(&mut buffer);
    let scale = 1.0 / n as f64;
    buffer.iter().map(|c| c.re * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn tone(freqs: &[f64], fs: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        let times: Vec<f64> = (0..n).map(|i| i as f64 / fs).collect();
        let values = times
            .iter()
            .map(|t| freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum())
            .collect();
        (times, values)
    }

    fn rms(values: &[f64]) -> f64 {
        (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
    }

    #[test]
    fn test_moving_average_constant_and_step() {
        assert_eq!(moving_average(&[2.0; 6], 3), vec![2.0; 6]);
        let smoothed = moving_average(&[0.0, 0.0, 3.0, 0.0, 0.0], 3);
        assert_eq!(smoothed, vec![0.0, 1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_lowpass_removes_high_tone() {
        // 10 Hz and 400 Hz tones on whole periods, 2 kHz sampling
        let (times, values) = tone(&[10.0, 400.0], 2000.0, 2000);
        let config = FilterConfig { kind: FilterType::Low, freq1: 50.0, freq2: 0.0, order: 4 };
        let filtered = config.apply(&values, &times);
        let (_, reference) = tone(&[10.0], 2000.0, 2000);
        let err: Vec<f64> = filtered.iter().zip(&reference).map(|(a, b)| a - b).collect();
        assert!(rms(&err) < 1e-3);
    }

    #[test]
    fn test_highpass_and_bandstop() {
        let (times, values) = tone(&[10.0, 400.0], 2000.0, 2000);
        let high = FilterConfig { kind: FilterType::High, freq1: 100.0, freq2: 0.0, order: 4 };
        let (_, reference) = tone(&[400.0], 2000.0, 2000);
        let err: Vec<f64> = high.apply(&values, &times).iter().zip(&reference).map(|(a, b)| a - b).collect();
        assert!(rms(&err) < 1e-3);

        let stop = FilterConfig { kind: FilterType::Bandstop, freq1: 5.0, freq2: 800.0, order: 6 };
        assert!(rms(&stop.apply(&values, &times)) < 0.05);
    }

    #[test]
    fn test_filter_validation() {
        let bad = FilterConfig { kind: FilterType::Bandpass, freq1: 300.0, freq2: 100.0, order: 2 };
        assert!(bad.validate().is_err());
        assert!(FilterConfig::default().validate().is_ok());
        assert_eq!("butter".parse::<FilterType>().is_err(), true);
    }
}
