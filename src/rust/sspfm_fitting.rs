use nalgebra::{DMatrix, DVector};
use std::f64;

use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_models::gaussian;

closed_enum! {
    FitMethod, "method" {
        LeastSq => "leastsq",
        LeastSquare => "least_square",
        Nelder => "nelder",
    }
}

impl Default for FitMethod {
    fn default() -> Self {
        FitMethod::LeastSq
    }
}

/// Fit parameter descriptor: value, free flag and bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Param {
    pub value: f64,
    pub vary: bool,
    pub min: f64,
    pub max: f64,
}

impl Param {
    pub fn free(value: f64) -> Self {
        Param { value, vary: true, min: f64::NEG_INFINITY, max: f64::INFINITY }
    }

    pub fn fixed(value: f64) -> Self {
        Param { value, vary: false, min: f64::NEG_INFINITY, max: f64::INFINITY }
    }

    pub fn bounded(value: f64, min: f64, max: f64) -> Self {
        Param { value: value.clamp(min, max), vary: true, min, max }
    }

    fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// Ordered, named parameter bag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    names: Vec<String>,
    params: Vec<Param>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, param: Param) -> &mut Self {
        if let Some(i) = self.position(name) {
            self.params[i] = param;
        } else {
            self.names.push(name.to_string());
            self.params.push(param);
        }
        self
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.position(name).map(|i| &self.params[i])
    }

    /// Parameter value, NaN when the name is unknown.
    pub fn value(&self, name: &str) -> f64 {
        self.get(name).map(|p| p.value).unwrap_or(f64::NAN)
    }

    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.names.iter().map(|n| n.as_str()).zip(self.params.iter())
    }

    fn with_values(&self, values: &[f64]) -> Params {
        let mut out = self.clone();
        for (p, &v) in out.params.iter_mut().zip(values) {
            p.value = v;
        }
        out
    }

    pub fn nan_like(&self) -> Params {
        self.with_values(&vec![f64::NAN; self.len()])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub method: FitMethod,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions { method: FitMethod::LeastSq, max_iter: 400, tol: 1e-10 }
    }
}

impl FitOptions {
    pub fn with_method(method: FitMethod) -> Self {
        FitOptions { method, ..Self::default() }
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: Params,
    pub chi_square: f64,
    pub n_iter: usize,
    pub converged: bool,
}

/// Maps free parameters between the solver space and parameter space.
struct Mapping {
    free: Vec<usize>,
    base: Vec<f64>,
    params: Vec<Param>,
    transform: bool,
}

impl Mapping {
    fn new(params: &Params, transform: bool) -> Self {
        let free = params
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.vary)
            .map(|(i, _)| i)
            .collect();
        Mapping { free, base: params.values(), params: params.params.clone(), transform }
    }

    fn to_internal(&self) -> Vec<f64> {
        self.free
            .iter()
            .map(|&i| {
                let p = &self.params[i];
                let v = p.clamp(p.value);
                if !self.transform {
                    return v;
                }
                match (p.min.is_finite(), p.max.is_finite()) {
                    (true, true) => (2.0 * (v - p.min) / (p.max - p.min) - 1.0).clamp(-1.0, 1.0).asin(),
                    (true, false) => ((v - p.min + 1.0).powi(2) - 1.0).max(0.0).sqrt(),
                    (false, true) => ((p.max - v + 1.0).powi(2) - 1.0).max(0.0).sqrt(),
                    (false, false) => v,
                }
            })
            .collect()
    }

    fn to_external(&self, internal: &[f64]) -> Vec<f64> {
        let mut values = self.base.clone();
        for (&i, &x) in self.free.iter().zip(internal) {
            let p = &self.params[i];
            values[i] = if !self.transform {
                p.clamp(x)
            } else {
                match (p.min.is_finite(), p.max.is_finite()) {
                    (true, true) => p.min + (x.sin() + 1.0) * (p.max - p.min) / 2.0,
                    (true, false) => p.min - 1.0 + (x * x + 1.0).sqrt(),
                    (false, true) => p.max + 1.0 - (x * x + 1.0).sqrt(),
                    (false, false) => x,
                }
            };
        }
        values
    }

    fn project(&self, internal: &mut [f64]) {
        if self.transform {
            return;
        }
        for (&i, x) in self.free.iter().zip(internal.iter_mut()) {
            *x = self.params[i].clamp(*x);
        }
    }
}

fn sum_squares(residuals: &[f64]) -> f64 {
    let s: f64 = residuals.iter().map(|r| r * r).sum();
    if s.is_finite() {
        s
    } else {
        f64::INFINITY
    }
}

/// Minimises the sum of squared residuals over the free parameters.
///
/// `residual` receives the full parameter vector in declaration order.
pub fn minimize<F>(residual: F, params: &Params, options: &FitOptions) -> SspfmResult<FitResult>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let mapping = Mapping::new(params, options.method == FitMethod::LeastSquare);
    if mapping.free.is_empty() {
        let chi_square = sum_squares(&residual(&params.values()));
        return Ok(FitResult { params: params.clone(), chi_square, n_iter: 0, converged: true });
    }
    let n_residuals = residual(&params.values()).len();
    if n_residuals < mapping.free.len() {
        return Err(SspfmError::Fit(format!(
            "{} residuals cannot constrain {} free parameters",
            n_residuals,
            mapping.free.len()
        )));
    }

    let (internal, chi_square, n_iter, converged) = match options.method {
        FitMethod::LeastSq | FitMethod::LeastSquare => levenberg_marquardt(&residual, &mapping, options),
        FitMethod::Nelder => nelder_mead(&residual, &mapping, options),
    };
    if !chi_square.is_finite() {
        return Err(SspfmError::Fit("Residuals are not finite at the solution".to_string()));
    }
    let values = mapping.to_external(&internal);
    Ok(FitResult { params: params.with_values(&values), chi_square, n_iter, converged })
}

fn levenberg_marquardt<F>(residual: &F, mapping: &Mapping, options: &FitOptions) -> (Vec<f64>, f64, usize, bool)
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let n = mapping.free.len();
    let mut x = mapping.to_internal();
    let mut r = residual(&mapping.to_external(&x));
    let mut cost = sum_squares(&r);
    let mut lambda = 1e-3;
    let m = r.len();

    for iter in 0..options.max_iter {
        if !cost.is_finite() {
            return (x, cost, iter, false);
        }
        let mut jac = DMatrix::<f64>::zeros(m, n);
        for j in 0..n {
            let h = 1e-7 * x[j].abs().max(1e-3);
            let mut x_step = x.clone();
            x_step[j] += h;
            let r_step = residual(&mapping.to_external(&x_step));
            for i in 0..m {
                jac[(i, j)] = (r_step[i] - r[i]) / h;
            }
        }
        let r_vec = DVector::from_column_slice(&r);
        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * r_vec;
        let diag_max = (0..n).map(|j| jtj[(j, j)]).fold(0.0, f64::max).max(1e-300);

        let mut improved = false;
        while lambda < 1e16 {
            let mut a = jtj.clone();
            for j in 0..n {
                a[(j, j)] += lambda * jtj[(j, j)].max(1e-12 * diag_max);
            }
            let delta = match a.lu().solve(&(-&jtr)) {
                Some(d) => d,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };
            let mut x_new: Vec<f64> = x.iter().zip(delta.iter()).map(|(a, b)| a + b).collect();
            mapping.project(&mut x_new);
            let r_new = residual(&mapping.to_external(&x_new));
            let cost_new = sum_squares(&r_new);
            if cost_new <= cost {
                let step: f64 = x_new.iter().zip(&x).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt();
                let scale: f64 = x.iter().map(|v| v * v).sum::<f64>().sqrt();
                let rel_drop = (cost - cost_new) / cost.max(f64::MIN_POSITIVE);
                x = x_new;
                r = r_new;
                cost = cost_new;
                lambda = (lambda / 10.0).max(1e-12);
                improved = true;
                if rel_drop < options.tol || step <= options.tol * (scale + options.tol) || cost == 0.0 {
                    return (x, cost, iter + 1, true);
                }
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            // no step reduces the cost: local minimum at the current point
            return (x, cost, iter + 1, true);
        }
    }
    (x, cost, options.max_iter, false)
}

fn nelder_mead<F>(residual: &F, mapping: &Mapping, options: &FitOptions) -> (Vec<f64>, f64, usize, bool)
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let n = mapping.free.len();
    let objective = |x: &[f64]| {
        let mut x = x.to_vec();
        mapping.project(&mut x);
        sum_squares(&residual(&mapping.to_external(&x)))
    };

    let x0 = mapping.to_internal();
    let mut simplex: Vec<Vec<f64>> = vec![x0.clone()];
    for j in 0..n {
        let mut v = x0.clone();
        v[j] = if v[j] != 0.0 { v[j] * 1.05 } else { 0.00025 };
        simplex.push(v);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| objective(v)).collect();
    let max_iter = options.max_iter * (n + 1) * 5;

    for iter in 0..max_iter {
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let spread = (values[n] - values[0]).abs();
        let size = simplex[1..]
            .iter()
            .flat_map(|v| v.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        if spread <= options.tol * (values[0].abs() + 1e-300) && size <= 1e-8 * (1.0 + simplex[0].iter().fold(0.0f64, |m, v| m.max(v.abs()))) {
            let mut best = simplex[0].clone();
            mapping.project(&mut best);
            return (best, values[0], iter, true);
        }

        let centroid: Vec<f64> = (0..n)
            .map(|j| simplex[..n].iter().map(|v| v[j]).sum::<f64>() / n as f64)
            .collect();
        let along = |t: f64| -> Vec<f64> {
            centroid.iter().zip(&simplex[n]).map(|(c, w)| c + t * (w - c)).collect()
        };

        let reflected = along(-1.0);
        let f_reflected = objective(&reflected);
        if f_reflected < values[0] {
            let expanded = along(-2.0);
            let f_expanded = objective(&expanded);
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                values[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                values[n] = f_reflected;
            }
        } else if f_reflected < values[n - 1] {
            simplex[n] = reflected;
            values[n] = f_reflected;
        } else {
            let contracted = if f_reflected < values[n] { along(-0.5) } else { along(0.5) };
            let f_contracted = objective(&contracted);
            if f_contracted < values[n].min(f_reflected) {
                simplex[n] = contracted;
                values[n] = f_contracted;
            } else {
                let best = simplex[0].clone();
                for i in 1..=n {
                    simplex[i] = best.iter().zip(&simplex[i]).map(|(b, v)| b + 0.5 * (v - b)).collect();
                    values[i] = objective(&simplex[i]);
                }
            }
        }
    }
    let best_index = (0..=n).min_by(|&a, &b| values[a].total_cmp(&values[b])).unwrap_or(0);
    let mut best = simplex[best_index].clone();
    mapping.project(&mut best);
    (best, values[best_index], max_iter, false)
}

#[derive(Debug, Default)]
pub struct QuadraticFitResult {
    pub peak_x: f64, // vertex of y = ax^2 + bx + c
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

/// Fits a quadratic function y = ax^2 + bx + c to N points using least squares.
/// x_coords and y_values must be of the same size and contain at least 3 points.
/// Returns the x-coordinate of the vertex (-b / 2a). Success only if 'a' is negative.
pub fn fit_quadratic_least_squares(x_coords: &[f64], y_values: &[f64]) -> SspfmResult<QuadraticFitResult> {
    let n = x_coords.len();
    let epsilon = 1e-12;

    if n < 3 || n != y_values.len() {
        return Err(SspfmError::Fit("Input vectors must be of the same size and contain at least 3 points for least squares.".to_string()));
    }

    // centred abscissa keeps the normal equations well conditioned
    let x_center = x_coords[n / 2];

    let s0 = n as f64;
    let mut s1 = 0.0;
    let mut s2 = 0.0;
    let mut s3 = 0.0;
    let mut s4 = 0.0;
    let mut t0 = 0.0;
    let mut t1 = 0.0;
    let mut t2 = 0.0;

    for i in 0..n {
        let x = x_coords[i] - x_center;
        let y = y_values[i];
        let x_sq = x * x;
        s1 += x;
        s2 += x_sq;
        s3 += x_sq * x;
        s4 += x_sq * x_sq;
        t0 += y;
        t1 += x * y;
        t2 += x_sq * y;
    }

    let d = s0 * (s2 * s4 - s3 * s3) - s1 * (s1 * s4 - s2 * s3) + s2 * (s1 * s3 - s2 * s2);

    if d.abs() < epsilon {
        return Err(SspfmError::Fit(format!("Denominator D ({}) is almost zero. Matrix is singular or ill-conditioned.", d)));
    }

    let dc_num = t0 * (s2 * s4 - s3 * s3) - s1 * (t1 * s4 - t2 * s3) + s2 * (t1 * s3 - t2 * s2);
    let db_num = s0 * (t1 * s4 - t2 * s3) - t0 * (s1 * s4 - s2 * s3) + s2 * (s1 * t2 - s2 * t1);
    let da_num = s0 * (s2 * t2 - s3 * t1) - s1 * (s1 * t2 - s2 * t1) + t0 * (s1 * s3 - s2 * s2);

    let a = da_num / d;
    let b_shifted = db_num / d;
    let c_shifted = dc_num / d;

    if a.abs() < epsilon {
        return Err(SspfmError::Fit("Coefficient 'a' is almost zero. Quadratic function is degenerate.".to_string()));
    }

    if a > 0.0 {
        return Err(SspfmError::Fit("Coefficient 'a' is positive. Quadratic function is convex downwards, no maximum exists.".to_string()));
    }

    let peak_x = -b_shifted / (2.0 * a) + x_center;
    let b = b_shifted - 2.0 * a * x_center;
    let c = c_shifted - b_shifted * x_center + a * x_center * x_center;

    Ok(QuadraticFitResult { peak_x, a, b, c })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    pub fn x_intercept(&self) -> f64 {
        -self.intercept / self.slope
    }
}

/// Ordinary least squares line; NaN samples are ignored.
pub fn fit_linear_least_squares(x_coords: &[f64], y_values: &[f64]) -> SspfmResult<LinearFit> {
    if x_coords.len() != y_values.len() {
        return Err(SspfmError::Fit("Input vectors must be of the same size.".to_string()));
    }
    let points: Vec<(f64, f64)> = x_coords
        .iter()
        .zip(y_values)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect();
    if points.len() < 2 {
        return Err(SspfmError::Fit("At least 2 finite points are needed for a linear fit.".to_string()));
    }

    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|p| p.0).sum();
    let sum_y: f64 = points.iter().map(|p| p.1).sum();
    let sum_xy: f64 = points.iter().map(|p| p.0 * p.1).sum();
    let sum_x_sq: f64 = points.iter().map(|p| p.0 * p.0).sum();

    let denominator = n * sum_x_sq - sum_x * sum_x;
    if denominator.abs() < 1e-12 * n * sum_x_sq.max(1e-300) {
        return Err(SspfmError::Fit("Denominator is zero, cannot fit a line.".to_string()));
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y * sum_x_sq - sum_x * sum_xy) / denominator;

    let mean_y = sum_y / n;
    let ss_tot: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();
    let ss_res: f64 = points.iter().map(|p| (p.1 - slope * p.0 - intercept).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    Ok(LinearFit { slope, intercept, r_squared })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub ampli: f64,
    pub mu: f64,
    pub sigma: f64,
}

/// Gaussian peak fit seeded from the given guess.
pub fn fit_gaussian(x_coords: &[f64], y_values: &[f64], guess: GaussianFit) -> SspfmResult<GaussianFit> {
    if x_coords.len() < 3 || x_coords.len() != y_values.len() {
        return Err(SspfmError::Fit("Gaussian fit needs at least 3 matching points.".to_string()));
    }
    let x_min = x_coords.iter().cloned().fold(f64::INFINITY, f64::min);
    let x_max = x_coords.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let width = (x_max - x_min).max(f64::MIN_POSITIVE);

    let mut params = Params::new();
    params
        .add("ampli", Param::bounded(guess.ampli, 0.0, f64::INFINITY))
        .add("mu", Param::bounded(guess.mu, x_min, x_max))
        .add("sigma", Param::bounded(guess.sigma.abs().max(width * 1e-3), width * 1e-4, width * 10.0));

    let result = minimize(
        |p: &[f64]| {
            x_coords
                .iter()
                .zip(y_values)
                .map(|(&x, &y)| gaussian(x, p[0], p[1], p[2]) - y)
                .collect()
        },
        &params,
        &FitOptions::default(),
    )?;
    Ok(GaussianFit {
        ampli: result.params.value("ampli"),
        mu: result.params.value("mu"),
        sigma: result.params.value("sigma"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_quadratic_least_squares_basic() {
        // vertex of y = -x^2 + 2x + 3 is x = 1, y = 4
        let x_coords = vec![0.0, 1.0, 2.0];
        let y_values = vec![3.0, 4.0, 3.0];

        let fit_result = fit_quadratic_least_squares(&x_coords, &y_values).unwrap();

        assert!((fit_result.peak_x - 1.0).abs() < 1e-9);
        assert!((fit_result.a - (-1.0)).abs() < 1e-9);
        assert!((fit_result.b - 2.0).abs() < 1e-9);
        assert!((fit_result.c - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_quadratic_least_squares_positive_a() {
        let x_coords = vec![-1.0, 0.0, 1.0];
        let y_values = vec![1.0, 0.0, 1.0];

        let result = fit_quadratic_least_squares(&x_coords, &y_values);
        if let Err(SspfmError::Fit(msg)) = result {
            assert!(msg.contains("Coefficient 'a' is positive"));
        } else {
            panic!("Unexpected result: {:?}", result);
        }
    }

    #[test]
    fn test_fit_quadratic_least_squares_insufficient_points() {
        let result = fit_quadratic_least_squares(&[0.0, 1.0], &[0.0, 1.0]);
        if let Err(SspfmError::Fit(msg)) = result {
            assert!(msg.contains("at least 3 points"));
        } else {
            panic!("Unexpected result: {:?}", result);
        }
    }

    #[test]
    fn test_linear_fit_and_intercept() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| -3.0 * v + 0.9).collect();
        let fit = fit_linear_least_squares(&x, &y).unwrap();
        assert!((fit.slope + 3.0).abs() < 1e-12);
        assert!((fit.x_intercept() - 0.3).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!(fit_linear_least_squares(&[1.0, 1.0], &[0.0, 2.0]).is_err());
    }

    fn exp_decay_problem() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..40).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.5 * (-1.3 * v).exp() + 0.4).collect();
        (x, y)
    }

    #[test]
    fn test_minimize_recovers_parameters_with_every_method() {
        let (x, y) = exp_decay_problem();
        for method in [FitMethod::LeastSq, FitMethod::LeastSquare, FitMethod::Nelder] {
            let mut params = Params::new();
            params
                .add("a", Param::bounded(1.0, 0.0, 10.0))
                .add("k", Param::bounded(0.5, 0.01, 5.0))
                .add("c", Param::free(0.0));
            let result = minimize(
                |p: &[f64]| x.iter().zip(&y).map(|(&xi, &yi)| p[0] * (-p[1] * xi).exp() + p[2] - yi).collect(),
                &params,
                &FitOptions::with_method(method),
            )
            .unwrap();
            assert!((result.params.value("a") - 2.5).abs() < 1e-4, "{}: {:?}", method, result.params);
            assert!((result.params.value("k") - 1.3).abs() < 1e-4, "{}: {:?}", method, result.params);
            assert!((result.params.value("c") - 0.4).abs() < 1e-4, "{}: {:?}", method, result.params);
        }
    }

    #[test]
    fn test_minimize_honours_fixed_and_bounds() {
        let (x, y) = exp_decay_problem();
        let mut params = Params::new();
        params
            .add("a", Param::bounded(1.0, 0.0, 2.0))
            .add("k", Param::fixed(1.3))
            .add("c", Param::free(0.0));
        let result = minimize(
            |p: &[f64]| x.iter().zip(&y).map(|(&xi, &yi)| p[0] * (-p[1] * xi).exp() + p[2] - yi).collect(),
            &params,
            &FitOptions::default(),
        )
        .unwrap();
        assert_eq!(result.params.value("k"), 1.3);
        assert!(result.params.value("a") <= 2.0);
        assert!(result.params.value("missing").is_nan());
    }

    #[test]
    fn test_fit_gaussian() {
        let x: Vec<f64> = (0..60).map(|i| -30.0 + i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&v| gaussian(v, 12.0, 3.2, 4.5)).collect();
        let fit = fit_gaussian(&x, &y, GaussianFit { ampli: 10.0, mu: 0.0, sigma: 3.0 }).unwrap();
        assert!((fit.mu - 3.2).abs() < 1e-5);
        assert!((fit.sigma - 4.5).abs() < 1e-5);
        assert!((fit.ampli - 12.0).abs() < 1e-5);
    }
}
