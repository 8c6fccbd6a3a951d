//! Closed-form model functions shared by the segment and hysteresis fits.

use num_complex::Complex;
use std::f64::consts::PI;

/// Complex response of a unit simple harmonic oscillator at `f`.
pub fn sho_response(f: f64, q: f64, f0: f64) -> Complex<f64> {
    let r = f / f0;
    Complex::new(1.0, 0.0) / Complex::new(1.0 - r * r, r / q)
}

/// SHO magnitude: `A / sqrt((1 - r^2)^2 + (r / Q)^2)` with `r = f / f0`.
pub fn sho(f: f64, ampli: f64, q: f64, f0: f64) -> f64 {
    ampli * sho_response(f, q, f0).norm()
}

/// SHO phase in radians, in `(-pi, 0)`, crossing `-pi/2` at resonance.
pub fn sho_phase(f: f64, q: f64, f0: f64) -> f64 {
    sho_response(f, q, f0).arg()
}

/// Resonance peak whose height at `x0` equals `ampli`.
pub fn sho_peak(f: f64, ampli: f64, coef: f64, x0: f64) -> f64 {
    sho(f, ampli, coef, x0) / coef
}

/// Phase step across the resonance; `ampli` is the total phase swing.
pub fn sho_phase_step(f: f64, ampli: f64, coef: f64, x0: f64, offset: f64) -> f64 {
    offset - ampli * sho_phase(f, coef, x0) / PI
}

pub fn gaussian(x: f64, ampli: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    ampli * (-0.5 * z * z).exp()
}

pub fn logistic(u: f64) -> f64 {
    if u >= 0.0 {
        1.0 / (1.0 + (-u).exp())
    } else {
        let e = u.exp();
        e / (1.0 + e)
    }
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// `ln(1 + e^u)` without overflow.
pub fn softplus(u: f64) -> f64 {
    if u > 0.0 {
        u + (-u).exp().ln_1p()
    } else {
        u.exp().ln_1p()
    }
}

pub fn sigmoid(x: f64, ampli: f64, coef: f64, x0: f64) -> f64 {
    ampli * logistic(coef * (x - x0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sho_peak_height_and_phase() {
        let (f0, q) = (326.0, 163.0);
        assert!((sho(f0, 1.0, q, f0) - q).abs() < 1e-9);
        assert!((sho_peak(f0, 2.5, q, f0) - 2.5).abs() < 1e-12);
        assert!((sho_phase(f0, q, f0) + PI / 2.0).abs() < 1e-12);
        assert!(sho_phase(f0 * 0.99, q, f0) > sho_phase(f0 * 1.01, q, f0));
        assert!((sho(0.0, 3.0, q, f0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_sho_phase_step_spans_ampli() {
        let low = sho_phase_step(1.0, PI, 50.0, 100.0, 0.2);
        let high = sho_phase_step(10_000.0, PI, 50.0, 100.0, 0.2);
        assert!((low - 0.2).abs() < 1e-3);
        assert!((high - (0.2 + PI)).abs() < 1e-3);
    }

    #[test]
    fn test_logistic_is_stable() {
        assert_eq!(logistic(1000.0), 1.0);
        assert_eq!(logistic(-1000.0), 0.0);
        assert!((logistic(0.0) - 0.5).abs() < 1e-15);
        assert!((logistic(logit(0.9)) - 0.9).abs() < 1e-12);
        assert!((softplus(800.0) - 800.0).abs() < 1e-9);
        assert!((softplus(0.0) - 2f64.ln()).abs() < 1e-15);
    }
}
