//! Two-branch hysteresis model with a shared affine background.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_fitting::{fit_linear_least_squares, minimize, FitMethod, FitOptions, Param, Params};
use crate::sspfm_models::{logistic, logit, softplus};
use crate::sspfm_nanoloop::Branch;
use crate::sspfm_utils::{mean, min_max};

closed_enum! {
    /// Switching shape of each branch.
    HystFunc, "hysteresis func" {
        Sigmoid => "sigmoid",
        Arctan => "arctan",
    }
}

impl Default for HystFunc {
    fn default() -> Self {
        HystFunc::Sigmoid
    }
}

impl HystFunc {
    /// Centred switching shape, ranging over `(-1/2, 1/2)`.
    pub fn shape(&self, u: f64) -> f64 {
        match self {
            HystFunc::Sigmoid => logistic(u) - 0.5,
            HystFunc::Arctan => u.atan() / PI,
        }
    }

    pub fn primitive(&self, u: f64) -> f64 {
        match self {
            HystFunc::Sigmoid => softplus(u) - u / 2.0,
            HystFunc::Arctan => (u * u.atan() - 0.5 * (u * u).ln_1p()) / PI,
        }
    }

    /// Reduced abscissa where the switch has covered the fraction `p` of its amplitude.
    pub fn inverse(&self, p: f64) -> f64 {
        match self {
            HystFunc::Sigmoid => logit(p),
            HystFunc::Arctan => (PI * (p - 0.5)).tan(),
        }
    }

    fn center_slope(&self) -> f64 {
        match self {
            HystFunc::Sigmoid => 0.25,
            HystFunc::Arctan => 1.0 / PI,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    pub func: HystFunc,
    pub method: FitMethod,
    pub asymmetric: bool,
    /// Onset of switching, percent of the branch amplitude.
    pub inf_thresh: f64,
    /// Saturation, percent of the branch amplitude.
    pub sat_thresh: f64,
    pub del_1st_loop: bool,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        HysteresisConfig {
            func: HystFunc::Sigmoid,
            method: FitMethod::LeastSq,
            asymmetric: false,
            inf_thresh: 10.0,
            sat_thresh: 90.0,
            del_1st_loop: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn both() -> [Side; 2] {
        [Side::Left, Side::Right]
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Side::Left => "l",
            Side::Right => "r",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchParams {
    pub ampli: f64,
    pub coef: f64,
    pub x0: f64,
}

impl BranchParams {
    fn nan() -> Self {
        BranchParams { ampli: f64::NAN, coef: f64::NAN, x0: f64::NAN }
    }
}

/// Fitted loop: `y = ampli_k * shape(coef_k * (x - x0_k)) + offset + slope * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisFit {
    pub func: HystFunc,
    pub asymmetric: bool,
    pub left: BranchParams,
    pub right: BranchParams,
    pub offset: f64,
    pub slope: f64,
    pub chi_square: f64,
}

impl HysteresisFit {
    pub fn nan(func: HystFunc, asymmetric: bool) -> Self {
        HysteresisFit {
            func,
            asymmetric,
            left: BranchParams::nan(),
            right: BranchParams::nan(),
            offset: f64::NAN,
            slope: f64::NAN,
            chi_square: f64::NAN,
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.left.ampli, self.left.coef, self.left.x0, self.right.ampli, self.right.coef, self.right.x0, self.offset, self.slope]
            .iter()
            .all(|v| v.is_finite())
    }

    pub fn branch(&self, side: Side) -> &BranchParams {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn eval_no_bg(&self, side: Side, x: f64) -> f64 {
        let b = self.branch(side);
        b.ampli * self.func.shape(b.coef * (x - b.x0))
    }

    pub fn background(&self, x: f64) -> f64 {
        self.offset + self.slope * x
    }

    pub fn eval(&self, side: Side, x: f64) -> f64 {
        self.eval_no_bg(side, x) + self.background(x)
    }

    /// `∫ branch dx` over `[a, b]`, background excluded.
    pub fn integral_no_bg(&self, side: Side, a: f64, b: f64) -> f64 {
        let p = self.branch(side);
        p.ampli / p.coef * (self.func.primitive(p.coef * (b - p.x0)) - self.func.primitive(p.coef * (a - p.x0)))
    }

    /// Named parameters in the order of the properties file.
    pub fn named_params(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        if self.asymmetric {
            out.push(("ampli_l".to_string(), self.left.ampli));
            out.push(("ampli_r".to_string(), self.right.ampli));
            out.push(("coef_l".to_string(), self.left.coef));
            out.push(("coef_r".to_string(), self.right.coef));
        } else {
            out.push(("ampli".to_string(), self.right.ampli));
            out.push(("coef".to_string(), self.right.coef));
        }
        out.push(("x0_l".to_string(), self.left.x0));
        out.push(("x0_r".to_string(), self.right.x0));
        out.push(("offset".to_string(), self.offset));
        out.push(("slope".to_string(), self.slope));
        out
    }
}

fn finite_points(branch: &Branch) -> (Vec<f64>, Vec<f64>) {
    branch
        .write_volt
        .iter()
        .zip(&branch.piezorep)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .unzip()
}

/// Slope of the saturated tails: high-bias end of the right branch and
/// low-bias end of the left branch.
fn tail_slope(right: &(Vec<f64>, Vec<f64>), left: &(Vec<f64>, Vec<f64>)) -> f64 {
    let mut slopes = Vec::new();
    let n_r = right.0.len();
    let k = (n_r / 5).max(2);
    if n_r >= k {
        if let Ok(fit) = fit_linear_least_squares(&right.0[n_r - k..], &right.1[n_r - k..]) {
            slopes.push(fit.slope);
        }
    }
    let n_l = left.0.len();
    let k = (n_l / 5).max(2);
    if n_l >= k {
        if let Ok(fit) = fit_linear_least_squares(&left.0[n_l - k..], &left.1[n_l - k..]) {
            slopes.push(fit.slope);
        }
    }
    if slopes.is_empty() {
        0.0
    } else {
        mean(&slopes)
    }
}

/// Abscissa where `ys` crosses `level`, linearly interpolated.
fn crossing(xs: &[f64], ys: &[f64], level: f64) -> Option<f64> {
    (0..xs.len().saturating_sub(1)).find_map(|i| {
        let (a, b) = (ys[i] - level, ys[i + 1] - level);
        if a == 0.0 {
            Some(xs[i])
        } else if a * b < 0.0 {
            Some(xs[i] + a * (xs[i + 1] - xs[i]) / (a - b))
        } else {
            None
        }
    })
}

struct BranchGuess {
    ampli: f64,
    coef: f64,
    x0: f64,
    level: f64,
}

fn guess_branch(xs: &[f64], detrended: &[f64], func: HystFunc, ascending: bool, fallback_x0: f64) -> BranchGuess {
    let n = xs.len();
    // right branch runs low to high bias, left branch high to low
    let (y_low, y_high) = if ascending { (detrended[0], detrended[n - 1]) } else { (detrended[n - 1], detrended[0]) };
    let ampli = y_high - y_low;
    let level = (y_high + y_low) / 2.0;
    let x0 = crossing(xs, detrended, level).unwrap_or(fallback_x0);
    let max_derivative = (0..n - 1)
        .filter(|&i| xs[i + 1] != xs[i])
        .map(|i| ((detrended[i + 1] - detrended[i]) / (xs[i + 1] - xs[i])).abs())
        .fold(0.0, f64::max);
    let coef = if ampli.abs() > 0.0 && max_derivative > 0.0 {
        max_derivative / (func.center_slope() * ampli.abs())
    } else {
        f64::NAN
    };
    BranchGuess { ampli, coef, x0, level }
}

/// Fits both branches of a loop. `counterclockwise` seeds the sign of the
/// amplitude when the data leave it undetermined.
pub fn fit_hysteresis(
    left: &Branch,
    right: &Branch,
    config: &HysteresisConfig,
    counterclockwise: bool,
) -> SspfmResult<HysteresisFit> {
    let left_pts = finite_points(left);
    let right_pts = finite_points(right);
    if left_pts.0.len() < 3 || right_pts.0.len() < 3 {
        return Err(SspfmError::Fit(format!(
            "Hysteresis fit needs 3 finite points per branch, got {} / {}",
            left_pts.0.len(),
            right_pts.0.len()
        )));
    }
    let all_x: Vec<f64> = left_pts.0.iter().chain(&right_pts.0).cloned().collect();
    let (x_min, x_max) = min_max(&all_x);
    let range = x_max - x_min;
    if !(range > 0.0) {
        return Err(SspfmError::Fit("Hysteresis loop spans no bias range".to_string()));
    }

    let slope0 = tail_slope(&right_pts, &left_pts);
    let detrend = |pts: &(Vec<f64>, Vec<f64>)| -> Vec<f64> { pts.0.iter().zip(&pts.1).map(|(x, y)| y - slope0 * x).collect() };
    let func = config.func;
    let g_r = guess_branch(&right_pts.0, &detrend(&right_pts), func, true, x_min + 0.75 * range);
    let g_l = guess_branch(&left_pts.0, &detrend(&left_pts), func, false, x_min + 0.25 * range);

    let default_coef = 10.0 / range;
    let sign = if counterclockwise { 1.0 } else { -1.0 };
    let seed_ampli = |a: f64| if a.is_finite() && a != 0.0 { a } else { sign * 1e-3 };
    let seed_coef = |c: f64| if c.is_finite() && c > 0.0 { c.min(1e3 / range) } else { default_coef };
    let coef_bounds = (1e-3 / range, 1e4 / range);

    let mut params = Params::new();
    if config.asymmetric {
        params
            .add("ampli_l", Param::free(seed_ampli(g_l.ampli)))
            .add("ampli_r", Param::free(seed_ampli(g_r.ampli)))
            .add("coef_l", Param::bounded(seed_coef(g_l.coef), coef_bounds.0, coef_bounds.1))
            .add("coef_r", Param::bounded(seed_coef(g_r.coef), coef_bounds.0, coef_bounds.1));
    } else {
        let ampli = seed_ampli((g_l.ampli + g_r.ampli) / 2.0);
        let coef = seed_coef(mean(&[seed_coef(g_l.coef), seed_coef(g_r.coef)]));
        params
            .add("ampli", Param::free(ampli))
            .add("coef", Param::bounded(coef, coef_bounds.0, coef_bounds.1));
    }
    params
        .add("x0_l", Param::bounded(g_l.x0, x_min, x_max))
        .add("x0_r", Param::bounded(g_r.x0, x_min, x_max))
        .add("offset", Param::free((g_l.level + g_r.level) / 2.0))
        .add("slope", Param::free(slope0));

    let asymmetric = config.asymmetric;
    let unpack = move |p: &[f64]| -> (BranchParams, BranchParams, f64, f64) {
        if asymmetric {
            (
                BranchParams { ampli: p[0], coef: p[2], x0: p[4] },
                BranchParams { ampli: p[1], coef: p[3], x0: p[5] },
                p[6],
                p[7],
            )
        } else {
            (
                BranchParams { ampli: p[0], coef: p[1], x0: p[2] },
                BranchParams { ampli: p[0], coef: p[1], x0: p[3] },
                p[4],
                p[5],
            )
        }
    };

    let result = minimize(
        |p: &[f64]| {
            let (bl, br, offset, slope) = unpack(p);
            let model = |b: &BranchParams, x: f64| b.ampli * func.shape(b.coef * (x - b.x0)) + offset + slope * x;
            left_pts
                .0
                .iter()
                .zip(&left_pts.1)
                .map(|(&x, &y)| model(&bl, x) - y)
                .chain(right_pts.0.iter().zip(&right_pts.1).map(|(&x, &y)| model(&br, x) - y))
                .collect()
        },
        &params,
        &FitOptions::with_method(config.method),
    )?;

    let (bl, br, offset, slope) = unpack(&result.params.values());
    let fit = HysteresisFit {
        func,
        asymmetric,
        left: bl,
        right: br,
        offset,
        slope,
        chi_square: result.chi_square,
    };
    if !fit.is_valid() {
        return Err(SspfmError::Fit("Hysteresis fit produced non-finite parameters".to_string()));
    }
    Ok(fit)
}
