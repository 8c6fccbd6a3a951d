use serde::{Deserialize, Serialize};

use crate::sspfm_hysteresis::{HysteresisConfig, HysteresisFit, Side};

closed_enum! {
    /// Whether an analysis domain comes from the fit or from the user.
    DomainMode, "domain mode" {
        Set => "set",
        Auto => "auto",
    }
}

impl Default for DomainMode {
    fn default() -> Self {
        DomainMode::Auto
    }
}

/// Bias window with its selection mode; `bounds` is only read in `set` mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Domain {
    pub mode: DomainMode,
    pub bounds: [f64; 2],
}

impl Default for Domain {
    fn default() -> Self {
        Domain { mode: DomainMode::Auto, bounds: [-5.0, 5.0] }
    }
}

impl Domain {
    pub fn low(&self) -> f64 {
        self.bounds[0].min(self.bounds[1])
    }

    pub fn high(&self) -> f64 {
        self.bounds[0].max(self.bounds[1])
    }
}

/// Ferroelectric descriptors of one loop, with or without background.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopCharacteristics {
    pub x0_l: f64,
    pub x0_r: f64,
    pub y0_l: f64,
    pub y0_r: f64,
    pub x_sat_l: f64,
    pub x_sat_r: f64,
    pub y_sat_l: f64,
    pub y_sat_r: f64,
    pub x_inf_l: f64,
    pub x_inf_r: f64,
    pub y_inf_l: f64,
    pub y_inf_r: f64,
    pub imprint: f64,
    pub width: f64,
    pub x_shift: f64,
    pub y_shift: f64,
    pub area: f64,
    pub ampli: f64,
}

impl LoopCharacteristics {
    pub fn named(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("x0 l", self.x0_l),
            ("x0 r", self.x0_r),
            ("y0 l", self.y0_l),
            ("y0 r", self.y0_r),
            ("x sat l", self.x_sat_l),
            ("x sat r", self.x_sat_r),
            ("y sat l", self.y_sat_l),
            ("y sat r", self.y_sat_r),
            ("x inf l", self.x_inf_l),
            ("x inf r", self.x_inf_r),
            ("y inf l", self.y_inf_l),
            ("y inf r", self.y_inf_r),
            ("imprint", self.imprint),
            ("width", self.width),
            ("x shift", self.x_shift),
            ("y shift", self.y_shift),
            ("area", self.area),
            ("ampli", self.ampli),
        ]
    }
}

/// Bias where a branch has covered `percent` of its switch.
///
/// The right branch switches upwards with bias, the left one downwards, so
/// the same fraction sits on opposite sides of each branch centre.
pub fn threshold_voltage(fit: &HysteresisFit, side: Side, percent: f64) -> f64 {
    let b = fit.branch(side);
    let u = fit.func.inverse(percent / 100.0);
    match side {
        Side::Right => b.x0 + u / b.coef,
        Side::Left => b.x0 - u / b.coef,
    }
}

/// Saturation voltages `(left, right)` in auto mode, the user window otherwise.
pub fn saturation_voltages(fit: &HysteresisFit, config: &HysteresisConfig, sat: &Domain) -> (f64, f64) {
    match sat.mode {
        DomainMode::Auto => (
            threshold_voltage(fit, Side::Left, config.sat_thresh),
            threshold_voltage(fit, Side::Right, config.sat_thresh),
        ),
        DomainMode::Set => (sat.low(), sat.high()),
    }
}

/// Root of `f` on `[lo, hi]` nearest to `guess`: grid scan, then bisection.
fn root_near<F: Fn(f64) -> f64>(f: F, lo: f64, hi: f64, guess: f64) -> f64 {
    const STEPS: usize = 2000;
    let step = (hi - lo) / STEPS as f64;
    let mut best: Option<(f64, f64)> = None;
    let mut prev_x = lo;
    let mut prev_y = f(lo);
    for i in 1..=STEPS {
        let x = if i == STEPS { hi } else { lo + step * i as f64 };
        let y = f(x);
        if prev_y == 0.0 || prev_y * y < 0.0 {
            let (mut a, mut b, mut fa) = (prev_x, x, prev_y);
            if fa == 0.0 {
                b = a;
            } else {
                for _ in 0..80 {
                    let m = 0.5 * (a + b);
                    let fm = f(m);
                    if fm == 0.0 {
                        a = m;
                        b = m;
                        break;
                    }
                    if fa * fm < 0.0 {
                        b = m;
                    } else {
                        a = m;
                        fa = fm;
                    }
                }
            }
            let root = 0.5 * (a + b);
            if best.map_or(true, |(_, d)| (root - guess).abs() < d) {
                best = Some((root, (root - guess).abs()));
            }
        }
        prev_x = x;
        prev_y = y;
    }
    best.map(|(root, _)| root).unwrap_or(f64::NAN)
}

/// Descriptors of the fitted loop over `bias_range`; `with_bg` keeps the
/// affine background in every ordinate.
pub fn characterize(
    fit: &HysteresisFit,
    bias_range: (f64, f64),
    config: &HysteresisConfig,
    sat: &Domain,
    with_bg: bool,
) -> LoopCharacteristics {
    let (lo, hi) = bias_range;
    let y = |side: Side, x: f64| if with_bg { fit.eval(side, x) } else { fit.eval_no_bg(side, x) };

    let (x0_l, x0_r) = if with_bg {
        (
            root_near(|x| fit.eval(Side::Left, x), lo, hi, fit.left.x0),
            root_near(|x| fit.eval(Side::Right, x), lo, hi, fit.right.x0),
        )
    } else {
        (fit.left.x0, fit.right.x0)
    };
    let (x_sat_l, x_sat_r) = saturation_voltages(fit, config, sat);
    let x_inf_l = threshold_voltage(fit, Side::Left, config.inf_thresh);
    let x_inf_r = threshold_voltage(fit, Side::Right, config.inf_thresh);
    let area = (fit.integral_no_bg(Side::Left, lo, hi) - fit.integral_no_bg(Side::Right, lo, hi)).abs();

    let y_sat_l = y(Side::Left, x_sat_l);
    let y_sat_r = y(Side::Right, x_sat_r);
    LoopCharacteristics {
        x0_l,
        x0_r,
        y0_l: y(Side::Left, 0.0),
        y0_r: y(Side::Right, 0.0),
        x_sat_l,
        x_sat_r,
        y_sat_l,
        y_sat_r,
        x_inf_l,
        x_inf_r,
        y_inf_l: y(Side::Left, x_inf_l),
        y_inf_r: y(Side::Right, x_inf_r),
        imprint: (x0_l + x0_r) / 2.0,
        width: x0_r - x0_l,
        x_shift: (fit.left.x0 + fit.right.x0) / 2.0,
        y_shift: if with_bg { fit.offset } else { (y_sat_l + y_sat_r) / 2.0 },
        area,
        ampli: (fit.left.ampli + fit.right.ampli) / 2.0,
    }
}

/// `fit pars`, `charac tot fit` and `charac no bg fit` properties of one loop.
pub fn loop_properties(
    fit: &HysteresisFit,
    bias_range: (f64, f64),
    config: &HysteresisConfig,
    sat: &Domain,
) -> Vec<(String, f64)> {
    let mut props: Vec<(String, f64)> = fit
        .named_params()
        .into_iter()
        .map(|(k, v)| (format!("fit pars: {}", k), v))
        .collect();
    for (prefix, with_bg) in [("charac tot fit", true), ("charac no bg fit", false)] {
        let charac = if fit.is_valid() {
            characterize(fit, bias_range, config, sat, with_bg)
        } else {
            nan_characteristics()
        };
        props.extend(charac.named().into_iter().map(|(k, v)| (format!("{}: {}", prefix, k), v)));
    }
    props
}

fn nan_characteristics() -> LoopCharacteristics {
    let n = f64::NAN;
    LoopCharacteristics {
        x0_l: n,
        x0_r: n,
        y0_l: n,
        y0_r: n,
        x_sat_l: n,
        x_sat_r: n,
        y_sat_l: n,
        y_sat_r: n,
        x_inf_l: n,
        x_inf_r: n,
        y_inf_l: n,
        y_inf_r: n,
        imprint: n,
        width: n,
        x_shift: n,
        y_shift: n,
        area: n,
        ampli: n,
    }
}
