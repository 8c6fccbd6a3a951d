use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::sspfm_cut::{FieldMode, SegmentInfo};
use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_filter::FilterConfig;
use crate::sspfm_fitting::{minimize, FitOptions, Param, Params};
use crate::sspfm_models::{sho, sho_peak, sho_phase, sho_phase_step};
use crate::sspfm_read::RawMeasurement;
use crate::sspfm_utils::{argmax, interp, mean, min_max, std_dev, trimmed_range};

closed_enum! {
    /// User-visible reduction mode of a segment window.
    ReductionMode, "mode" {
        Max => "max",
        Fit => "fit",
        SingleFreq => "single_freq",
        Dfrt => "dfrt",
    }
}

impl Default for ReductionMode {
    fn default() -> Self {
        ReductionMode::Dfrt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReduction {
    Max,
    Fit,
}

/// Internal shape of the reduction, derived once from the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentShape {
    Sweep(SweepReduction),
    Stable { sidebands: bool },
}

impl ReductionMode {
    pub fn shape(&self, has_sidebands: bool) -> SegmentShape {
        match self {
            ReductionMode::Max => SegmentShape::Sweep(SweepReduction::Max),
            ReductionMode::Fit => SegmentShape::Sweep(SweepReduction::Fit),
            ReductionMode::SingleFreq => SegmentShape::Stable { sidebands: false },
            ReductionMode::Dfrt => SegmentShape::Stable { sidebands: has_sidebands },
        }
    }
}

/// Symmetric trim applied to every window, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CutPercent {
    pub start: f64,
    pub end: f64,
}

impl Default for CutPercent {
    fn default() -> Self {
        CutPercent { start: 5.0, end: 5.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakFitConfig {
    pub fit_pha: bool,
    pub detect_peak: bool,
    pub sens_peak_detect: f64,
}

impl Default for PeakFitConfig {
    fn default() -> Self {
        PeakFitConfig { fit_pha: false, detect_peak: false, sens_peak_detect: 1.5 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReductionConfig {
    pub cut: CutPercent,
    pub filter: FilterConfig,
    pub fit: PeakFitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: usize,
    pub write_voltage: f64,
    pub read_voltage: f64,
    pub field: FieldMode,
    pub amp: f64,
    pub pha: f64,
    pub res_freq: f64,
    pub q_fact: f64,
    pub amp_std: f64,
    pub pha_std: f64,
    pub res_freq_std: f64,
    pub error: Option<String>,
}

impl Segment {
    fn empty(info: &SegmentInfo) -> Self {
        Segment {
            index: info.index,
            write_voltage: info.write_voltage,
            read_voltage: info.read_voltage,
            field: info.field,
            amp: f64::NAN,
            pha: f64::NAN,
            res_freq: f64::NAN,
            q_fact: f64::NAN,
            amp_std: f64::NAN,
            pha_std: f64::NAN,
            res_freq_std: f64::NAN,
            error: None,
        }
    }

    fn failed(info: &SegmentInfo, error: String) -> Self {
        Segment { error: Some(error), ..Segment::empty(info) }
    }
}

/// Reduces one window of the raw measurement to a `Segment`.
///
/// Never fails: problems are recorded in `Segment::error` with NaN scalars.
pub fn reduce(info: &SegmentInfo, raw: &RawMeasurement, config: &ReductionConfig) -> Segment {
    let width = info.end_index.saturating_sub(info.start_index);
    let (lo, hi) = trimmed_range(width, config.cut.start, config.cut.end);
    let (start, end) = (info.start_index + lo, info.start_index + hi);
    if end <= start || end > raw.len() {
        return Segment::failed(info, format!("empty window [{}, {})", start, end));
    }

    let times = &raw.times[start..end];
    let amp = config.filter.apply(&raw.amp[start..end], times);
    let pha = config.filter.apply(&raw.pha[start..end], times);
    let freq = raw.freq.as_ref().map(|f| &f[start..end]);

    let outcome = match info.mode.shape(raw.sidebands.is_some()) {
        SegmentShape::Sweep(SweepReduction::Max) => match freq {
            Some(freq) => Ok(reduce_max(info, &amp, &pha, freq)),
            None => Err("frequency channel missing for a sweep reduction".to_string()),
        },
        SegmentShape::Sweep(SweepReduction::Fit) => match freq {
            Some(freq) => reduce_fit(info, &amp, &pha, freq, &config.fit),
            None => Err("frequency channel missing for a sweep reduction".to_string()),
        },
        SegmentShape::Stable { sidebands } => Ok(reduce_stable(info, raw, start, end, &amp, &pha, freq, sidebands)),
    };
    outcome.unwrap_or_else(|error| Segment::failed(info, error))
}

fn reduce_max(info: &SegmentInfo, amp: &[f64], pha: &[f64], freq: &[f64]) -> Segment {
    let mut segment = Segment::empty(info);
    if let Some(idx) = argmax(amp) {
        segment.amp = amp[idx];
        segment.pha = pha[idx];
        segment.res_freq = freq[idx];
        segment.q_fact = q_factor(freq, amp, idx);
    } else {
        segment.error = Some("no finite amplitude in window".to_string());
    }
    segment
}

/// `f_peak / df(-3 dB)`; NaN when the half-power level is not crossed on both sides.
pub fn q_factor(freq: &[f64], amp: &[f64], idx: usize) -> f64 {
    let threshold = amp[idx] / 2f64.sqrt();
    let crossing = |i_in: usize, i_out: usize| {
        let (a_in, a_out) = (amp[i_in], amp[i_out]);
        freq[i_out] + (threshold - a_out) * (freq[i_in] - freq[i_out]) / (a_in - a_out)
    };

    let mut left = idx;
    while left > 0 && amp[left - 1] >= threshold {
        left -= 1;
    }
    if left == 0 {
        return f64::NAN;
    }
    let mut right = idx;
    while right + 1 < amp.len() && amp[right + 1] >= threshold {
        right += 1;
    }
    if right + 1 >= amp.len() {
        return f64::NAN;
    }
    let f_left = crossing(left, left - 1);
    let f_right = crossing(right, right + 1);
    let width = (f_right - f_left).abs();
    if width > 0.0 {
        freq[idx] / width
    } else {
        f64::NAN
    }
}

fn reduce_fit(
    info: &SegmentInfo,
    amp: &[f64],
    pha: &[f64],
    freq: &[f64],
    config: &PeakFitConfig,
) -> Result<Segment, String> {
    let idx = argmax(amp).ok_or_else(|| "no finite amplitude in window".to_string())?;
    let (amp_min, amp_max) = min_max(amp);
    if config.detect_peak && amp_max < config.sens_peak_detect * mean(amp) {
        return Err("no peak".to_string());
    }

    let (f_min, f_max) = min_max(freq);
    let span = f_max - f_min;
    if !(span > 0.0) {
        return Err("frequency does not sweep within the window".to_string());
    }
    let q_guess = q_factor(freq, amp, idx);
    let q_guess = if q_guess.is_finite() { q_guess } else { 10.0 * freq[idx] / span };

    let mut params = Params::new();
    params
        .add("ampli", Param::bounded(amp_max - amp_min, 0.0, f64::INFINITY))
        .add("coef", Param::bounded(q_guess, 0.5, 1e6))
        .add("x0", Param::bounded(freq[idx], f_min, f_max))
        .add("offset", Param::free(amp_min))
        .add("slope", Param::free(0.0));

    let fit = minimize(
        |p: &[f64]| {
            freq.iter()
                .zip(amp)
                .map(|(&f, &a)| sho_peak(f, p[0], p[1], p[2]) + p[3] + p[4] * f - a)
                .collect()
        },
        &params,
        &FitOptions::default(),
    )
    .map_err(|e| e.to_string())?;

    let mut segment = Segment::empty(info);
    segment.amp = fit.params.value("ampli");
    segment.q_fact = fit.params.value("coef");
    segment.res_freq = fit.params.value("x0");

    segment.pha = if config.fit_pha {
        fit_phase(freq, pha, segment.q_fact, segment.res_freq)?
    } else {
        let (sorted_f, sorted_p) = sorted_pairs(freq, pha);
        interp(segment.res_freq, &sorted_f, &sorted_p)
    };
    Ok(segment)
}

fn sorted_pairs(x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = x.iter().cloned().zip(y.iter().cloned()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs.into_iter().unzip()
}

/// SHO phase fit, in degrees, evaluated at the fitted resonance.
///
/// A monotone phase lets the resonance move; an S-shaped one keeps the
/// resonance and quality factor from the amplitude fit.
fn fit_phase(freq: &[f64], pha_deg: &[f64], q: f64, f0: f64) -> Result<f64, String> {
    let (freq, pha_deg) = sorted_pairs(freq, pha_deg);
    let pha: Vec<f64> = pha_deg.iter().map(|p| p.to_radians()).collect();
    let n = pha.len();
    let edge = (n / 10).max(1);
    let start_mean = mean(&pha[..edge]);
    let end_mean = mean(&pha[n - edge..]);
    let direction = if end_mean >= start_mean { 1.0 } else { -1.0 };

    let steps = pha.windows(2).filter(|w| (w[1] - w[0]) * direction >= 0.0).count();
    let monotone = steps as f64 >= 0.8 * (n - 1) as f64;

    let (f_min, f_max) = min_max(&freq);
    let swing = (end_mean - start_mean).abs().min(PI).max(1e-3) * direction;

    let mut params = Params::new();
    params.add("ampli", Param::bounded(swing, -PI, PI));
    if monotone {
        params
            .add("coef", Param::bounded(q, 0.5, 1e6))
            .add("x0", Param::bounded(f0, f_min, f_max));
    } else {
        params.add("coef", Param::fixed(q)).add("x0", Param::fixed(f0));
    }
    params.add("offset", Param::free(start_mean));

    let fit = minimize(
        |p: &[f64]| {
            freq.iter()
                .zip(&pha)
                .map(|(&f, &y)| sho_phase_step(f, p[0], p[1], p[2], p[3]) - y)
                .collect()
        },
        &params,
        &FitOptions::default(),
    )
    .map_err(|e| e.to_string())?;

    let p = fit.params.values();
    Ok(sho_phase_step(p[2], p[0], p[1], p[2], p[3]).to_degrees())
}

#[allow(clippy::too_many_arguments)]
fn reduce_stable(
    info: &SegmentInfo,
    raw: &RawMeasurement,
    start: usize,
    end: usize,
    amp: &[f64],
    pha: &[f64],
    freq: Option<&[f64]>,
    sidebands: bool,
) -> Segment {
    let mut segment = Segment::empty(info);
    segment.amp = mean(amp);
    segment.pha = mean(pha);
    segment.amp_std = std_dev(amp);
    segment.pha_std = std_dev(pha);
    if let Some(freq) = freq {
        segment.res_freq = mean(freq);
        segment.res_freq_std = std_dev(freq);
    }

    if sidebands {
        if let Some(sb) = raw.sidebands.as_ref() {
            let inversion = dfrt_inversion(
                mean(&sb.freq_l[start..end]),
                mean(&sb.amp_l[start..end]),
                mean(&sb.pha_l[start..end]),
                mean(&sb.freq_r[start..end]),
                mean(&sb.amp_r[start..end]),
                mean(&sb.pha_r[start..end]),
            );
            match inversion {
                Ok(dfrt) => {
                    segment.amp = dfrt.amp;
                    segment.pha = dfrt.pha;
                    segment.res_freq = dfrt.res_freq;
                    segment.q_fact = dfrt.q_fact;
                }
                Err(e) => {
                    segment.res_freq = f64::NAN;
                    segment.res_freq_std = f64::NAN;
                    segment.error = Some(e.to_string());
                }
            }
        }
    }
    segment
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DfrtResult {
    pub amp: f64,
    pub pha: f64,
    pub res_freq: f64,
    pub q_fact: f64,
}

/// Recovers resonance frequency, quality factor, peak amplitude and drive
/// phase from the two sideband bins. Phases in degrees, frequencies in any
/// common unit.
pub fn dfrt_inversion(
    freq_l: f64,
    amp_l: f64,
    pha_l: f64,
    freq_r: f64,
    amp_r: f64,
    pha_r: f64,
) -> SspfmResult<DfrtResult> {
    if !(freq_r > freq_l && freq_l > 0.0) {
        return Err(SspfmError::Fit(format!(
            "sideband inconsistency: right frequency {} must exceed left frequency {}",
            freq_r, freq_l
        )));
    }
    let d_pha = (pha_r - pha_l).to_radians();
    if !(d_pha > 0.0 && d_pha < PI) || !(amp_l > 0.0 && amp_r > 0.0) {
        return Err(SspfmError::Fit(format!(
            "sideband inconsistency: phase step {:.4} deg, amplitudes {} / {}",
            pha_r - pha_l,
            amp_l,
            amp_r
        )));
    }

    let phi = d_pha.tan();
    let omega = freq_l * amp_l / (freq_r * amp_r);
    let root = phi.signum() * (1.0 + phi * phi).sqrt();
    let x1 = (-1.0 + root / omega) / phi;
    let x2 = (1.0 - root * omega) / phi;

    let num = freq_r * x1 - freq_l * x2;
    let den = freq_l * x1 - freq_r * x2;
    let res_freq_sq = freq_l * freq_r * num / den;
    let q_sq_num = freq_l * freq_r * num * den;
    if !(res_freq_sq > 0.0 && q_sq_num > 0.0) {
        return Err(SspfmError::Fit("sideband inconsistency: no physical resonance".to_string()));
    }
    let res_freq = res_freq_sq.sqrt();
    let q_fact = q_sq_num.sqrt() / (freq_r * freq_r - freq_l * freq_l);

    let amp = amp_l * q_fact / sho(freq_l, 1.0, q_fact, res_freq);
    let pha = pha_l + sho_phase(freq_l, q_fact, res_freq).to_degrees();
    Ok(DfrtResult { amp, pha, res_freq, q_fact })
}

/// Sideband readings produced by an oscillator; the forward model of `dfrt_inversion`.
pub fn dfrt_sidebands(freq: f64, amp: f64, pha: f64, q: f64, res_freq: f64) -> (f64, f64) {
    let a = amp / q * sho(freq, 1.0, q, res_freq);
    let p = pha - sho_phase(freq, q, res_freq).to_degrees();
    (a, p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sspfm_read::Sidebands;

    fn info(len: usize, mode: ReductionMode) -> SegmentInfo {
        SegmentInfo {
            start_index: 0,
            end_index: len,
            times: (0..len).map(|i| i as f64 * 1e-4).collect(),
            write_voltage: 1.0,
            read_voltage: 0.0,
            field: FieldMode::Off,
            mode,
            index: 3,
        }
    }

    fn raw_constant(len: usize, amp: f64, pha: f64) -> RawMeasurement {
        RawMeasurement {
            times: (0..len).map(|i| i as f64 * 1e-4).collect(),
            amp: vec![amp; len],
            pha: vec![pha; len],
            freq: Some(vec![326.0; len]),
            ..RawMeasurement::default()
        }
    }

    fn sweep(len: usize, f0: f64, q: f64, ampli: f64) -> RawMeasurement {
        let freq: Vec<f64> = (0..len).map(|i| f0 - 10.0 + 20.0 * i as f64 / (len - 1) as f64).collect();
        let amp = freq.iter().map(|&f| sho_peak(f, ampli, q, f0) + 0.01).collect();
        let pha = freq.iter().map(|&f| 90.0 - sho_phase(f, q, f0).to_degrees()).collect();
        RawMeasurement {
            times: (0..len).map(|i| i as f64 * 1e-4).collect(),
            amp,
            pha,
            freq: Some(freq),
            ..RawMeasurement::default()
        }
    }

    #[test]
    fn test_stable_constant_signal() {
        let raw = raw_constant(50, 0.37, 12.5);
        let config = ReductionConfig::default();
        let seg = reduce(&info(50, ReductionMode::SingleFreq), &raw, &config);
        assert_eq!(seg.amp_std, 0.0);
        assert_eq!(seg.pha_std, 0.0);
        assert_eq!(seg.amp, 0.37);
        assert_eq!(seg.pha, 12.5);
        assert_eq!(seg.res_freq, 326.0);
        assert!(seg.q_fact.is_nan());
        assert!(seg.error.is_none());
        assert_eq!(seg.index, 3);
    }

    #[test]
    fn test_max_mode_takes_argmax_bin() {
        let raw = sweep(201, 326.0, 80.0, 2.0);
        let config = ReductionConfig { cut: CutPercent { start: 10.0, end: 10.0 }, ..ReductionConfig::default() };
        let seg = reduce(&info(201, ReductionMode::Max), &raw, &config);
        let freq = raw.freq.as_ref().unwrap();
        let (lo, hi) = trimmed_range(201, 10.0, 10.0);
        let idx = argmax(&raw.amp[lo..hi]).unwrap();
        assert_eq!(seg.res_freq, freq[lo + idx]);
        assert_eq!(seg.amp, raw.amp[lo + idx]);
        // -3 dB width of a Q = 80 peak at 326 kHz is about 4 kHz
        assert!((seg.q_fact - 80.0).abs() < 8.0, "q = {}", seg.q_fact);
    }

    #[test]
    fn test_q_factor_nan_without_both_crossings() {
        let freq = [1.0, 2.0, 3.0, 4.0];
        let amp = [1.0, 0.95, 0.9, 0.1];
        assert!(q_factor(&freq, &amp, 0).is_nan());
    }

    #[test]
    fn test_fit_mode_recovers_sho_peak() {
        let raw = sweep(301, 326.0, 80.0, 2.0);
        let config = ReductionConfig { cut: CutPercent { start: 0.0, end: 0.0 }, ..ReductionConfig::default() };
        let seg = reduce(&info(301, ReductionMode::Fit), &raw, &config);
        assert!(seg.error.is_none(), "{:?}", seg.error);
        assert!((seg.res_freq - 326.0).abs() < 1e-3);
        assert!((seg.q_fact - 80.0).abs() < 0.1);
        assert!((seg.amp - 2.0).abs() < 1e-3);
        assert!((seg.pha - 180.0).abs() < 0.5);
    }

    #[test]
    fn test_fit_mode_phase_fit() {
        let mut raw = sweep(301, 326.0, 80.0, 2.0);
        // swing of 0.8 pi keeps the step amplitude off its bound
        raw.pha = raw.freq.as_ref().unwrap().iter().map(|&f| 90.0 - 0.8 * sho_phase(f, 80.0, 326.0).to_degrees()).collect();
        let mut config = ReductionConfig { cut: CutPercent { start: 0.0, end: 0.0 }, ..ReductionConfig::default() };
        config.fit.fit_pha = true;
        let seg = reduce(&info(301, ReductionMode::Fit), &raw, &config);
        assert!(seg.error.is_none(), "{:?}", seg.error);
        assert!((seg.pha - 162.0).abs() < 1.0, "pha = {}", seg.pha);
    }

    #[test]
    fn test_fit_mode_no_peak_gate() {
        let raw = raw_constant(100, 1.0, 0.0);
        let mut raw = raw;
        raw.freq = Some((0..100).map(|i| 300.0 + i as f64 * 0.5).collect());
        let mut config = ReductionConfig::default();
        config.fit.detect_peak = true;
        let seg = reduce(&info(100, ReductionMode::Fit), &raw, &config);
        assert_eq!(seg.error.as_deref(), Some("no peak"));
        assert!(seg.amp.is_nan());
    }

    #[test]
    fn test_sweep_without_frequency_is_tagged() {
        let mut raw = raw_constant(20, 1.0, 0.0);
        raw.freq = None;
        let seg = reduce(&info(20, ReductionMode::Max), &raw, &ReductionConfig::default());
        assert!(seg.error.is_some());
        assert!(seg.res_freq.is_nan());
    }

    #[test]
    fn test_dfrt_inversion_is_exact() {
        for &(f0, q, amp, pha) in &[(326.0, 163.0, 1.3, 25.0), (300.0, 40.0, 0.02, -110.0), (1000.0, 500.0, 7.0, 0.0)] {
            let (fl, fr) = (f0 - f0 / q * 0.7, f0 + f0 / q * 0.9);
            let (al, pl) = dfrt_sidebands(fl, amp, pha, q, f0);
            let (ar, pr) = dfrt_sidebands(fr, amp, pha, q, f0);
            let out = dfrt_inversion(fl, al, pl, fr, ar, pr).unwrap();
            assert!((out.res_freq - f0).abs() < 1e-8 * f0);
            assert!((out.q_fact - q).abs() < 1e-7 * q);
            assert!((out.amp - amp).abs() < 1e-8 * amp);
            assert!((out.pha - pha).abs() < 1e-7);
        }
    }

    #[test]
    fn test_dfrt_inconsistent_sidebands() {
        assert!(dfrt_inversion(330.0, 1.0, 0.0, 320.0, 1.0, 10.0).is_err());
        assert!(dfrt_inversion(320.0, 1.0, 10.0, 330.0, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_dfrt_segment_reduction() {
        let (f0, q, amp, pha) = (326.0, 163.0, 0.8, 180.0);
        let (fl, fr) = (325.0, 327.0);
        let (al, pl) = dfrt_sidebands(fl, amp, pha, q, f0);
        let (ar, pr) = dfrt_sidebands(fr, amp, pha, q, f0);
        let len = 40;
        let mut raw = raw_constant(len, amp / q * sho(326.0, 1.0, q, f0), 0.0);
        raw.sidebands = Some(Sidebands {
            amp_l: vec![al; len],
            pha_l: vec![pl; len],
            freq_l: vec![fl; len],
            amp_r: vec![ar; len],
            pha_r: vec![pr; len],
            freq_r: vec![fr; len],
        });
        let seg = reduce(&info(len, ReductionMode::Dfrt), &raw, &ReductionConfig::default());
        assert!(seg.error.is_none());
        assert!((seg.res_freq - f0).abs() < 1e-6);
        assert!((seg.q_fact - q).abs() < 1e-4);
        assert!((seg.amp - amp).abs() < 1e-9);
        assert!((seg.pha - pha).abs() < 1e-6);

        let single = reduce(&info(len, ReductionMode::SingleFreq), &raw, &ReductionConfig::default());
        assert!(single.q_fact.is_nan());
    }
}
