//! Phase calibration: histogram peaks, polarisation targets and the
//! correction applied before the piezoresponse is computed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sspfm_cut::FieldMode;
use crate::sspfm_fitting::{fit_gaussian, fit_quadratic_least_squares, GaussianFit};
use crate::sspfm_utils::mean;

closed_enum! {
    /// Phase correction applied to a pixel.
    CorrMode, "pha_corr" {
        Raw => "raw",
        Offset => "offset",
        Affine => "affine",
        UpDown => "up_down",
    }
}

closed_enum! {
    /// Function turning (amplitude, phase) into piezoresponse.
    PiezoFunc, "pha_func" {
        Cos => "cos",
        Sin => "sin",
    }
}

closed_enum! {
    /// Sign forced on the on-field electrostatic slope, if any.
    LockedElecSlope, "locked_elec_slope" {
        Positive => "+",
        Negative => "-",
        Unlocked => "None",
    }
}

closed_enum! {
    /// How histogram peaks are located.
    HistoMethod, "histo method" {
        Fit => "fit",
        Max => "max",
    }
}

impl Default for CorrMode {
    fn default() -> Self {
        CorrMode::Offset
    }
}

impl Default for PiezoFunc {
    fn default() -> Self {
        PiezoFunc::Cos
    }
}

impl Default for LockedElecSlope {
    fn default() -> Self {
        LockedElecSlope::Unlocked
    }
}

impl Default for HistoMethod {
    fn default() -> Self {
        HistoMethod::Fit
    }
}

impl PiezoFunc {
    pub fn apply(&self, amp: f64, pha_deg: f64) -> f64 {
        match self {
            PiezoFunc::Cos => amp * pha_deg.to_radians().cos(),
            PiezoFunc::Sin => amp * pha_deg.to_radians().sin(),
        }
    }
}

/// User flags driving the phase calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseFlags {
    pub corr: CorrMode,
    #[serde(alias = "fwd")]
    pub pha_fwd: f64,
    #[serde(alias = "rev")]
    pub pha_rev: f64,
    pub func: PiezoFunc,
    pub main_elec: bool,
    pub locked_elec_slope: LockedElecSlope,
    pub grounded_tip: bool,
    pub positive_d33: bool,
}

impl Default for PhaseFlags {
    fn default() -> Self {
        PhaseFlags {
            corr: CorrMode::Offset,
            pha_fwd: 0.0,
            pha_rev: 180.0,
            func: PiezoFunc::Cos,
            main_elec: true,
            locked_elec_slope: LockedElecSlope::Unlocked,
            grounded_tip: true,
            positive_d33: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCalibration {
    pub corr_mode: CorrMode,
    pub reverse: bool,
    pub coef_a: f64,
    pub coef_b: f64,
    pub target_pha_low: f64,
    pub target_pha_high: f64,
    pub measured_pha_low: f64,
    pub measured_pha_high: f64,
    pub func: PiezoFunc,
    /// Set when the requested correction could not be built.
    pub fallback: Option<String>,
}

impl PhaseCalibration {
    pub fn raw(func: PiezoFunc) -> Self {
        PhaseCalibration {
            corr_mode: CorrMode::Raw,
            reverse: false,
            coef_a: 1.0,
            coef_b: 0.0,
            target_pha_low: f64::NAN,
            target_pha_high: f64::NAN,
            measured_pha_low: f64::NAN,
            measured_pha_high: f64::NAN,
            func,
            fallback: None,
        }
    }

    /// Corrected phase of one raw sample. Distances to the measured peaks
    /// are taken on the circle, so any 360 degree window of `x` works.
    pub fn correct(&self, x: f64) -> f64 {
        match self.corr_mode {
            CorrMode::Raw => x,
            CorrMode::Offset => self.coef_a * x + self.coef_b,
            CorrMode::Affine => {
                // anchored on the nearer measured peak so both peaks map exactly
                let (d_low, d_high) = (arc(x, self.measured_pha_low), arc(x, self.measured_pha_high));
                if d_low.abs() <= d_high.abs() {
                    self.target_pha_low + self.coef_a * d_low
                } else {
                    self.target_pha_high + self.coef_a * d_high
                }
            }
            CorrMode::UpDown => {
                if x.is_nan() {
                    x
                } else if arc(x, self.measured_pha_low).abs() <= arc(x, self.measured_pha_high).abs() {
                    self.target_pha_low
                } else {
                    self.target_pha_high
                }
            }
        }
    }

    pub fn correct_all(&self, phases: &[f64]) -> Vec<f64> {
        phases.iter().map(|&x| self.correct(x)).collect()
    }

    pub fn piezoresponse(&self, amp: f64, raw_pha: f64) -> f64 {
        self.func.apply(amp, self.correct(raw_pha))
    }
}

/// Signed angle from `to` to `x`, in `[-180, 180)`.
fn arc(x: f64, to: f64) -> f64 {
    wrap(x - to, -180.0, 180.0)
}

/// Polarisation targets `(down, up)` for the field mode and flags.
fn polarity_targets(field: FieldMode, flags: &PhaseFlags) -> (f64, f64) {
    let (fwd, rev) = (flags.pha_fwd, flags.pha_rev);
    if field == FieldMode::On && flags.main_elec {
        match flags.locked_elec_slope {
            LockedElecSlope::Unlocked if flags.grounded_tip => (fwd, rev),
            LockedElecSlope::Unlocked => (rev, fwd),
            LockedElecSlope::Positive => (rev, fwd),
            LockedElecSlope::Negative => (fwd, rev),
        }
    } else if flags.positive_d33 {
        (rev, fwd)
    } else {
        (fwd, rev)
    }
}

/// Targets `(bias_low, bias_high)`; a grounded tip pairs low bias with the down state.
pub fn bias_targets(field: FieldMode, flags: &PhaseFlags) -> (f64, f64) {
    let (down, up) = polarity_targets(field, flags);
    if flags.grounded_tip {
        (down, up)
    } else {
        (up, down)
    }
}

/// Sign of the mean gradient of the per-voltage mean phase.
pub fn positive_phase_gradient(phases: &[f64], write_voltages: &[f64]) -> bool {
    let mut by_voltage: BTreeMap<i64, (f64, Vec<f64>)> = BTreeMap::new();
    for (&pha, &volt) in phases.iter().zip(write_voltages) {
        if pha.is_finite() && volt.is_finite() {
            // keyed on microvolts so equal voltages group together
            let key = (volt * 1e6).round() as i64;
            by_voltage.entry(key).or_insert_with(|| (volt, Vec::new())).1.push(pha);
        }
    }
    let points: Vec<(f64, f64)> = by_voltage.values().map(|(v, p)| (*v, mean(p))).collect();
    if points.len() < 2 {
        return true;
    }
    let gradients: Vec<f64> = points
        .windows(2)
        .map(|w| (w[1].1 - w[0].1) / (w[1].0 - w[0].0))
        .collect();
    mean(&gradients) >= 0.0
}

/// Histogram of values over `[lo, hi)` with uniform bins.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub lo: f64,
    pub width: f64,
    pub counts: Vec<f64>,
}

impl Histogram {
    pub fn new(values: &[f64], lo: f64, hi: f64, bins: usize) -> Self {
        let bins = bins.max(1);
        let width = (hi - lo) / bins as f64;
        let mut counts = vec![0.0; bins];
        for &v in values.iter().filter(|v| v.is_finite()) {
            let idx = ((v - lo) / width).floor();
            if idx >= 0.0 {
                counts[(idx as usize).min(bins - 1)] += 1.0;
            }
        }
        Histogram { lo, width, counts }
    }

    pub fn center(&self, idx: usize) -> f64 {
        self.lo + (idx as f64 + 0.5) * self.width
    }

    fn circular_distance(&self, a: usize, b: usize) -> usize {
        let n = self.counts.len();
        let d = if a > b { a - b } else { b - a };
        d.min(n - d)
    }

    /// Up to `max_peaks` local maxima, strongest first, at least
    /// `min_separation` bins apart on the circle.
    pub fn peaks(&self, min_separation: usize, max_peaks: usize) -> Vec<usize> {
        let n = self.counts.len();
        let mut candidates: Vec<usize> = (0..n)
            .filter(|&i| {
                let c = self.counts[i];
                c > 0.0 && c >= self.counts[(i + n - 1) % n] && c >= self.counts[(i + 1) % n]
            })
            .collect();
        candidates.sort_by(|&a, &b| self.counts[b].total_cmp(&self.counts[a]).then(a.cmp(&b)));

        let mut chosen: Vec<usize> = Vec::new();
        for idx in candidates {
            if chosen.len() == max_peaks {
                break;
            }
            if let Some(&main) = chosen.first() {
                if self.counts[idx] < (0.1 * self.counts[main]).max(2.0) {
                    continue;
                }
            }
            if chosen.iter().all(|&c| self.circular_distance(c, idx) >= min_separation) {
                chosen.push(idx);
            }
        }
        chosen
    }

    /// Peak position refined on its neighbourhood of `half_width` bins.
    fn refine(&self, idx: usize, half_width: usize, method: HistoMethod) -> f64 {
        let n = self.counts.len() as isize;
        let window = |half: usize| -> (Vec<f64>, Vec<f64>) {
            (-(half as isize)..=half as isize)
                .map(|k| {
                    let j = (idx as isize + k).rem_euclid(n) as usize;
                    (self.center(idx) + k as f64 * self.width, self.counts[j])
                })
                .unzip()
        };
        let vertex = {
            let (x, y) = window(1);
            match fit_quadratic_least_squares(&x, &y) {
                Ok(q) if (q.peak_x - self.center(idx)).abs() <= self.width => q.peak_x,
                _ => self.center(idx),
            }
        };
        match method {
            HistoMethod::Max => vertex,
            HistoMethod::Fit => {
                let (x, y) = window(half_width.max(2));
                let guess = GaussianFit { ampli: self.counts[idx], mu: vertex, sigma: self.width };
                match fit_gaussian(&x, &y, guess) {
                    Ok(g) if (g.mu - vertex).abs() <= half_width.max(1) as f64 * self.width => g.mu,
                    _ => vertex,
                }
            }
        }
    }
}

/// Principal phase peaks over the 360 degree window starting at `lo`.
pub fn histogram_peaks(phases: &[f64], lo: f64, method: HistoMethod) -> Vec<f64> {
    let wrapped: Vec<f64> = phases
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| wrap(v, lo, lo + 360.0))
        .collect();
    if wrapped.is_empty() {
        return Vec::new();
    }
    let bins = (wrapped.len() / 4).clamp(8, 360);
    let hist = Histogram::new(&wrapped, lo, lo + 360.0, bins);
    let separation = (bins / 5).max(1);
    hist.peaks(separation, 2)
        .into_iter()
        .map(|idx| wrap(hist.refine(idx, separation / 2, method), lo, lo + 360.0))
        .collect()
}

/// Builds the correction of one pixel. `phases` are offset-applied raw phases.
pub fn calibrate(
    phases: &[f64],
    write_voltages: &[f64],
    field: FieldMode,
    flags: &PhaseFlags,
    method: HistoMethod,
    window_lo: f64,
) -> PhaseCalibration {
    let mut calibration = PhaseCalibration::raw(flags.func);
    let (target_low, target_high) = bias_targets(field, flags);
    calibration.target_pha_low = target_low;
    calibration.target_pha_high = target_high;

    let peaks = histogram_peaks(phases, window_lo, method);
    if peaks.len() < 2 {
        if flags.corr != CorrMode::Raw {
            calibration.fallback = Some(format!(
                "{} phase histogram holds {} peak(s), phase left raw",
                field.label(),
                peaks.len()
            ));
        }
        return calibration;
    }

    let (small, large) = if peaks[0] < peaks[1] { (peaks[0], peaks[1]) } else { (peaks[1], peaks[0]) };
    // gradient taken in the window centred between the peaks, away from its edges
    let mid = (small + large) / 2.0;
    let centred = apply_phase_offset(phases, mid, -180.0, 180.0);
    let (meas_low, meas_high) = if positive_phase_gradient(&centred, write_voltages) {
        (small, large)
    } else {
        (large, small)
    };
    calibration.measured_pha_low = meas_low;
    calibration.measured_pha_high = meas_high;
    calibration.reverse = (meas_high - meas_low).signum() != (target_high - target_low).signum();

    let sign = if calibration.reverse { -1.0 } else { 1.0 };
    let (coef_a, coef_b) = match flags.corr {
        CorrMode::Raw => (1.0, 0.0),
        CorrMode::Offset | CorrMode::UpDown => {
            let target_mean = (target_low + target_high) / 2.0;
            let meas_mean = (meas_low + meas_high) / 2.0;
            (sign, target_mean - sign * meas_mean)
        }
        CorrMode::Affine => {
            let a = (target_high - target_low) / (meas_high - meas_low);
            (a, target_low - a * meas_low)
        }
    };
    calibration.corr_mode = flags.corr;
    calibration.coef_a = coef_a;
    calibration.coef_b = coef_b;
    calibration
}

/// Single peak position, or mean of the two principal peaks.
pub fn offset_from_histogram(phases: &[f64], method: HistoMethod) -> f64 {
    let peaks = histogram_peaks(phases, -180.0, method);
    match peaks.as_slice() {
        [] => f64::NAN,
        [single] => *single,
        [a, b, ..] => (a + b) / 2.0,
    }
}

/// Mean of several offsets on the circle, in `[-180, 180)`.
pub fn mean_offset(offsets: &[f64]) -> f64 {
    let finite: Vec<f64> = offsets.iter().cloned().filter(|v| v.is_finite()).collect();
    let Some(&first) = finite.first() else {
        return f64::NAN;
    };
    let unwrapped: Vec<f64> = finite
        .iter()
        .map(|&v| first + wrap(v - first, -180.0, 180.0))
        .collect();
    wrap(mean(&unwrapped), -180.0, 180.0)
}

/// Wraps `x` into `[lo, hi)`.
pub fn wrap(x: f64, lo: f64, hi: f64) -> f64 {
    if !x.is_finite() {
        return x;
    }
    let period = hi - lo;
    let y = lo + (x - lo).rem_euclid(period);
    if y >= hi {
        lo
    } else {
        y
    }
}

/// Rotates the phase window by `offset` and wraps every value into it.
pub fn apply_phase_offset(phases: &[f64], offset: f64, pha_min: f64, pha_max: f64) -> Vec<f64> {
    let offset = if offset.is_finite() { offset } else { 0.0 };
    let (lo, hi) = (pha_min + offset, pha_max + offset);
    phases.iter().map(|&x| wrap(x, lo, hi)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bipolar loop: phase `low` for negative write bias, `high` above.
    fn bipolar(low: f64, high: f64, jitter: f64) -> (Vec<f64>, Vec<f64>) {
        let volts: Vec<f64> = (0..200).map(|i| -10.0 + 20.0 * (i % 50) as f64 / 49.0).collect();
        let phases = volts
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let noise = jitter * (((i * 37) % 11) as f64 / 10.0 - 0.5);
                if v < 0.0 { low + noise } else { high + noise }
            })
            .collect();
        (phases, volts)
    }

    #[test]
    fn test_target_table() {
        let mut flags = PhaseFlags::default();
        // on field, main elec, unlocked, grounded tip: down -> fwd
        assert_eq!(bias_targets(FieldMode::On, &flags), (0.0, 180.0));
        flags.locked_elec_slope = LockedElecSlope::Positive;
        assert_eq!(bias_targets(FieldMode::On, &flags), (180.0, 0.0));
        flags.locked_elec_slope = LockedElecSlope::Negative;
        assert_eq!(bias_targets(FieldMode::On, &flags), (0.0, 180.0));
        // off field, positive d33: down -> rev
        assert_eq!(bias_targets(FieldMode::Off, &flags), (180.0, 0.0));
        flags.positive_d33 = false;
        assert_eq!(bias_targets(FieldMode::Off, &flags), (0.0, 180.0));
        flags.grounded_tip = false;
        assert_eq!(bias_targets(FieldMode::Off, &flags), (180.0, 0.0));
        flags.main_elec = false;
        flags.locked_elec_slope = LockedElecSlope::Unlocked;
        assert_eq!(bias_targets(FieldMode::On, &flags), (180.0, 0.0));
    }

    #[test]
    fn test_histogram_finds_two_peaks() {
        let (phases, _) = bipolar(-90.0, 90.0, 4.0);
        for method in [HistoMethod::Max, HistoMethod::Fit] {
            let mut peaks = histogram_peaks(&phases, -180.0, method);
            peaks.sort_by(|a, b| a.total_cmp(b));
            assert_eq!(peaks.len(), 2);
            assert!((peaks[0] + 90.0).abs() < 5.0, "{:?}", peaks);
            assert!((peaks[1] - 90.0).abs() < 5.0, "{:?}", peaks);
        }
    }

    #[test]
    fn test_affine_maps_peaks_to_targets() {
        let (phases, volts) = bipolar(-60.0, 100.0, 2.0);
        let flags = PhaseFlags { corr: CorrMode::Affine, ..PhaseFlags::default() };
        let cal = calibrate(&phases, &volts, FieldMode::Off, &flags, HistoMethod::Max, -180.0);
        assert_eq!(cal.corr_mode, CorrMode::Affine);
        assert_eq!(cal.correct(cal.measured_pha_low), cal.target_pha_low);
        assert!((cal.correct(cal.measured_pha_high) - cal.target_pha_high).abs() < 1e-12);
        assert!(cal.measured_pha_low < cal.measured_pha_high);
    }

    #[test]
    fn test_reverse_and_up_down() {
        // phase rises with bias, off-field targets fall (180 -> 0)
        let (phases, volts) = bipolar(10.0, 150.0, 3.0);
        let flags = PhaseFlags { corr: CorrMode::UpDown, ..PhaseFlags::default() };
        let cal = calibrate(&phases, &volts, FieldMode::Off, &flags, HistoMethod::Fit, -180.0);
        let expected_reverse = (cal.measured_pha_high - cal.measured_pha_low).signum()
            != (cal.target_pha_high - cal.target_pha_low).signum();
        assert_eq!(cal.reverse, expected_reverse);
        assert!(cal.reverse);
        for x in cal.correct_all(&phases) {
            assert!(x == cal.target_pha_low || x == cal.target_pha_high);
        }
        assert_eq!(cal.correct(12.0), 180.0);
        assert_eq!(cal.correct(149.0), 0.0);
    }

    #[test]
    fn test_shifted_window_keeps_polarisations_apart() {
        // stored in [-90, 270) after a stage-1 offset of 90 deg
        let (phases, volts) = bipolar(200.0, 20.0, 2.0);
        let flags = PhaseFlags { corr: CorrMode::UpDown, ..PhaseFlags::default() };
        let cal = calibrate(&phases, &volts, FieldMode::Off, &flags, HistoMethod::Max, -180.0);
        assert!((wrap(cal.measured_pha_low, -180.0, 180.0) + 160.0).abs() < 5.0, "{:?}", cal);
        assert!((cal.measured_pha_high - 20.0).abs() < 5.0, "{:?}", cal);
        assert_eq!(cal.correct(200.0), cal.target_pha_low);
        assert_eq!(cal.correct(20.0), cal.target_pha_high);
        assert_ne!(cal.target_pha_low, cal.target_pha_high);

        let flags = PhaseFlags { corr: CorrMode::Affine, pha_fwd: 10.0, pha_rev: 100.0, ..PhaseFlags::default() };
        let cal = calibrate(&phases, &volts, FieldMode::Off, &flags, HistoMethod::Max, -180.0);
        assert!((cal.coef_a.abs() - 0.5).abs() < 0.05, "{:?}", cal);
        for (&x, &v) in phases.iter().zip(&volts) {
            let target = if v < 0.0 { cal.target_pha_low } else { cal.target_pha_high };
            assert!((cal.correct(x) - target).abs() < 5.0, "x = {} -> {}", x, cal.correct(x));
        }
    }

    #[test]
    fn test_offset_correction_maps_mean() {
        let (phases, volts) = bipolar(-20.0, 160.0, 0.0);
        let cal = calibrate(&phases, &volts, FieldMode::Off, &PhaseFlags::default(), HistoMethod::Max, -180.0);
        assert!(cal.reverse);
        let low = cal.correct(cal.measured_pha_low);
        let high = cal.correct(cal.measured_pha_high);
        assert!((low - cal.target_pha_low).abs() < 1e-9);
        assert!((high - cal.target_pha_high).abs() < 1e-9);
    }

    #[test]
    fn test_unipolar_falls_back_to_raw() {
        let volts: Vec<f64> = (0..100).map(|i| i as f64 * 0.1).collect();
        let phases: Vec<f64> = (0..100).map(|i| 40.0 + ((i * 7) % 5) as f64).collect();
        let cal = calibrate(&phases, &volts, FieldMode::Off, &PhaseFlags::default(), HistoMethod::Fit, -180.0);
        assert_eq!(cal.corr_mode, CorrMode::Raw);
        assert!(cal.fallback.is_some());
        assert_eq!(cal.correct(42.0), 42.0);
        assert!((offset_from_histogram(&phases, HistoMethod::Max) - 42.0).abs() < 25.0);
    }

    #[test]
    fn test_offset_from_two_peaks() {
        let (phases, _) = bipolar(-90.0, 90.0, 2.0);
        assert!(offset_from_histogram(&phases, HistoMethod::Max).abs() < 5.0);
    }

    #[test]
    fn test_mean_offset_wraps() {
        assert!((mean_offset(&[170.0, -170.0]).abs() - 180.0).abs() < 1e-9);
        assert!((mean_offset(&[10.0, 30.0]) - 20.0).abs() < 1e-12);
        assert!(mean_offset(&[]).is_nan());
        assert_eq!(mean_offset(&[f64::NAN, 15.0]), 15.0);
    }

    #[test]
    fn test_apply_phase_offset_window() {
        let phases: Vec<f64> = (-800..800).map(|i| i as f64 * 0.73).collect();
        for &offset in &[0.0, 45.0, -130.0, 359.0] {
            for y in apply_phase_offset(&phases, offset, -180.0, 180.0) {
                assert!(y >= -180.0 + offset && y < 180.0 + offset, "{} {}", y, offset);
            }
        }
        assert_eq!(apply_phase_offset(&[190.0], 0.0, -180.0, 180.0), vec![-170.0]);
        assert!(apply_phase_offset(&[f64::NAN], 0.0, -180.0, 180.0)[0].is_nan());
    }

    #[test]
    fn test_piezoresponse_function() {
        let cal = PhaseCalibration::raw(PiezoFunc::Cos);
        assert!((cal.piezoresponse(2.0, 180.0) + 2.0).abs() < 1e-12);
        let cal = PhaseCalibration::raw(PiezoFunc::Sin);
        assert!((cal.piezoresponse(2.0, 90.0) - 2.0).abs() < 1e-12);
    }
}
