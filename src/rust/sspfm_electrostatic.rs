//! Electrostatic decoupling: on-field saturation slope and CPD, on/off
//! differential piezoresponse and the fitted y-shift.

use serde::{Deserialize, Serialize};

use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_fitting::{fit_linear_least_squares, LinearFit};
use crate::sspfm_hysteresis::{HysteresisConfig, HysteresisFit};
use crate::sspfm_nanoloop::{Branch, Nanoloop};
use crate::sspfm_properties::{saturation_voltages, Domain, DomainMode};
use crate::sspfm_utils::{interp, mean};

/// `electrostatic` block of the stage-2 configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectrostaticConfig {
    pub diff_mode: DomainMode,
    pub diff_domain: [f64; 2],
    pub sat_mode: DomainMode,
    pub sat_domain: [f64; 2],
}

impl Default for ElectrostaticConfig {
    fn default() -> Self {
        let domain = Domain::default();
        ElectrostaticConfig {
            diff_mode: domain.mode,
            diff_domain: domain.bounds,
            sat_mode: domain.mode,
            sat_domain: domain.bounds,
        }
    }
}

impl ElectrostaticConfig {
    pub fn diff(&self) -> Domain {
        Domain { mode: self.diff_mode, bounds: self.diff_domain }
    }

    pub fn sat(&self) -> Domain {
        Domain { mode: self.sat_mode, bounds: self.sat_domain }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaturationAnalysis {
    pub domain: (f64, f64),
    pub slope: f64,
    pub cpd: f64,
    pub fit_high: Option<LinearFit>,
    pub fit_low: Option<LinearFit>,
}

impl SaturationAnalysis {
    pub fn properties(&self) -> Vec<(String, f64)> {
        vec![
            ("elec sat analysis: slope".to_string(), self.slope),
            ("elec sat analysis: cpd".to_string(), self.cpd),
            ("elec sat analysis: domain low".to_string(), self.domain.0),
            ("elec sat analysis: domain high".to_string(), self.domain.1),
        ]
    }
}

/// `[min(x_sat_l, x_sat_r), max(...)]` in auto mode, the user window otherwise.
pub fn saturation_domain(fit: &HysteresisFit, hyst: &HysteresisConfig, sat: &Domain) -> (f64, f64) {
    match sat.mode {
        DomainMode::Set => (sat.low(), sat.high()),
        DomainMode::Auto => {
            let (l, r) = saturation_voltages(fit, hyst, sat);
            (l.min(r), l.max(r))
        }
    }
}

fn loop_points(nanoloop: &Nanoloop) -> (Vec<f64>, Vec<f64>) {
    nanoloop
        .write_volt
        .iter()
        .zip(&nanoloop.piezorep)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .unzip()
}

/// Lines through the saturated parts of an on-field loop, beyond each end
/// of `domain`; slope and CPD are averaged over the sides that could be fitted.
pub fn saturation_analysis(nanoloop: &Nanoloop, domain: (f64, f64)) -> SaturationAnalysis {
    let (xs, ys) = loop_points(nanoloop);
    let side_fit = |keep: &dyn Fn(f64) -> bool| -> Option<LinearFit> {
        let (x, y): (Vec<f64>, Vec<f64>) = xs
            .iter()
            .zip(&ys)
            .filter(|(x, _)| keep(**x))
            .map(|(&x, &y)| (x, y))
            .unzip();
        fit_linear_least_squares(&x, &y).ok()
    };
    let fit_high = side_fit(&|x: f64| x >= domain.1);
    let fit_low = side_fit(&|x: f64| x <= domain.0);

    let fits: Vec<LinearFit> = [fit_high, fit_low].iter().flatten().cloned().collect();
    let (slope, cpd) = if fits.is_empty() {
        (f64::NAN, f64::NAN)
    } else {
        let slope = mean(&fits.iter().map(|f| f.slope).collect::<Vec<_>>());
        let intercept = mean(&fits.iter().map(|f| f.intercept).collect::<Vec<_>>());
        (slope, -intercept / slope)
    };
    SaturationAnalysis { domain, slope, cpd, fit_high, fit_low }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifferentialAnalysis {
    pub domain: (f64, f64),
    pub offset_off: f64,
    pub fit: LinearFit,
}

impl DifferentialAnalysis {
    pub fn cpd(&self) -> f64 {
        self.fit.x_intercept()
    }

    pub fn properties(&self) -> Vec<(String, f64)> {
        vec![
            ("elec diff analysis: a".to_string(), self.fit.slope),
            ("elec diff analysis: b".to_string(), self.fit.intercept),
            ("elec diff analysis: cpd".to_string(), self.cpd()),
            ("elec diff analysis: r2".to_string(), self.fit.r_squared),
        ]
    }
}

fn ascending(branch: &Branch) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = branch
        .write_volt
        .iter()
        .cloned()
        .zip(branch.piezorep.iter().cloned())
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs.dedup_by(|a, b| a.0 == b.0);
    pairs.into_iter().unzip()
}

/// On-field minus off-field piezoresponse, branch by branch, with the off
/// loop interpolated on the on-field bias grid. `domain` restricts the bias
/// range of the line fit.
pub fn differential_analysis(
    on: &Nanoloop,
    off: &Nanoloop,
    offset_off: f64,
    domain: (f64, f64),
) -> SspfmResult<DifferentialAnalysis> {
    let mut xs = Vec::new();
    let mut diffs = Vec::new();
    for (on_branch, off_branch) in [(&on.left, &off.left), (&on.right, &off.right)] {
        let (off_x, off_y) = ascending(off_branch);
        for (&x, &y_on) in on_branch.write_volt.iter().zip(&on_branch.piezorep) {
            if x < domain.0 || x > domain.1 {
                continue;
            }
            let y_off = interp(x, &off_x, &off_y);
            if y_on.is_finite() && y_off.is_finite() {
                xs.push(x);
                diffs.push(y_on - (y_off - offset_off));
            }
        }
    }
    let fit = fit_linear_least_squares(&xs, &diffs).map_err(|e| {
        SspfmError::Fit(format!("Differential analysis over [{}, {}]: {}", domain.0, domain.1, e))
    })?;
    Ok(DifferentialAnalysis { domain, offset_off, fit })
}

/// Bias window of the differential fit: the user window in `set` mode, the
/// whole loop otherwise.
pub fn differential_domain(on: &Nanoloop, diff: &Domain) -> (f64, f64) {
    match diff.mode {
        DomainMode::Set => (diff.low(), diff.high()),
        DomainMode::Auto => on.bias_range(),
    }
}

/// Pure electrostatic y-shift carried by the fitted background.
pub fn offset_analysis(fit: &HysteresisFit) -> Vec<(String, f64)> {
    vec![("elec offset analysis: y shift".to_string(), fit.offset)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sspfm_hysteresis::tests::{generator, synthetic_rows};
    use crate::sspfm_phase::{PhaseCalibration, PiezoFunc};

    fn loop_from(fit: &HysteresisFit, n_w: usize) -> Nanoloop {
        Nanoloop::from_rows(&synthetic_rows(fit, n_w, 10.0, 0.0), &PhaseCalibration::raw(PiezoFunc::Cos))
    }

    #[test]
    fn test_saturation_auto_and_set_domains() {
        let fit = generator(1.0, 4.0, -2.0, 2.0, 0.0, -3.0);
        let hyst = HysteresisConfig::default();
        let auto = saturation_domain(&fit, &hyst, &Domain::default());
        let (l, r) = saturation_voltages(&fit, &hyst, &Domain::default());
        assert_eq!(auto, (l, r));

        let set = Domain { mode: DomainMode::Set, bounds: [-6.0, 6.5] };
        assert_eq!(saturation_domain(&fit, &hyst, &set), (-6.0, 6.5));
    }

    #[test]
    fn test_saturation_slope_and_cpd() {
        // electrostatic line -3 (x - 0.3) on top of a symmetric loop
        let fit = generator(1.0, 4.0, -2.0, 2.0, 0.9, -3.0);
        let nanoloop = loop_from(&fit, 41);
        let window = Domain { mode: DomainMode::Set, bounds: [-6.0, 6.0] };
        let domain = saturation_domain(&fit, &HysteresisConfig::default(), &window);
        let sat = saturation_analysis(&nanoloop, domain);
        assert!((sat.slope + 3.0).abs() < 1e-4, "{:?}", sat);
        assert!((sat.cpd - 0.3).abs() < 1e-4, "{:?}", sat);
        assert!(sat.fit_high.is_some() && sat.fit_low.is_some());
    }

    #[test]
    fn test_differential_recovers_line() {
        let off_fit = generator(1.0, 3.0, -2.0, 2.0, 0.0, 0.0);
        let mut on_fit = off_fit;
        on_fit.slope = -3.0;
        on_fit.offset = 0.9;
        let off = loop_from(&off_fit, 41);
        let on = loop_from(&on_fit, 41);

        let diff = differential_analysis(&on, &off, 0.0, differential_domain(&on, &Domain::default())).unwrap();
        assert!((diff.fit.slope + 3.0).abs() < 1e-9);
        assert!((diff.cpd() - 0.3).abs() < 1e-9);

        let window = Domain { mode: DomainMode::Set, bounds: [-4.0, 4.0] };
        let diff = differential_analysis(&on, &off, 0.5, differential_domain(&on, &window)).unwrap();
        assert_eq!(diff.domain, (-4.0, 4.0));
        assert!((diff.fit.intercept - 1.4).abs() < 1e-9);

        let empty = Domain { mode: DomainMode::Set, bounds: [20.0, 30.0] };
        assert!(differential_analysis(&on, &off, 0.0, differential_domain(&on, &empty)).is_err());
    }

    #[test]
    fn test_config_block() {
        let config: ElectrostaticConfig = toml::from_str("sat_mode = \"set\"\nsat_domain = [-7.0, 7.0]").unwrap();
        assert_eq!(config.sat(), Domain { mode: DomainMode::Set, bounds: [-7.0, 7.0] });
        assert_eq!(config.diff(), Domain::default());
        assert!(toml::from_str::<ElectrostaticConfig>("diff_mode = \"manual\"").is_err());
    }
}
