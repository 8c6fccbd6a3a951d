use std::cmp::Ordering;
use std::path::Path;

/// Mean accumulated around the first value, exact for constant input.
pub fn mean(values: &[f64]) -> f64 {
    match values.first() {
        None => f64::NAN,
        Some(&first) => first + values.iter().map(|v| v - first).sum::<f64>() / values.len() as f64,
    }
}

/// Sample standard deviation (n - 1 denominator); 0 for a single value.
pub fn std_dev(values: &[f64]) -> f64 {
    match values.len() {
        0 => f64::NAN,
        1 => 0.0,
        n => {
            let m = mean(values);
            (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        }
    }
}

/// Mean over the finite values only; NaN when none is finite.
pub fn nan_mean(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().cloned().filter(|v| v.is_finite()).collect();
    mean(&finite)
}

pub fn nan_std(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().cloned().filter(|v| v.is_finite()).collect();
    std_dev(&finite)
}

/// Index of the first maximum, ignoring NaN.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

pub fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Linear interpolation on an ascending grid; NaN outside it.
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    if xs.is_empty() || xs.len() != ys.len() || x < xs[0] || x > xs[xs.len() - 1] {
        return f64::NAN;
    }
    match xs.iter().position(|&v| v >= x) {
        Some(0) => ys[0],
        Some(i) => {
            let (x0, x1) = (xs[i - 1], xs[i]);
            if x1 == x0 {
                ys[i]
            } else {
                ys[i - 1] + (ys[i] - ys[i - 1]) * (x - x0) / (x1 - x0)
            }
        }
        None => f64::NAN,
    }
}

/// Indices of the window left after trimming `start_pct` / `end_pct` percent.
pub fn trimmed_range(len: usize, start_pct: f64, end_pct: f64) -> (usize, usize) {
    let start = ((len as f64) * start_pct / 100.0).floor() as usize;
    let cut_end = ((len as f64) * end_pct / 100.0).floor() as usize;
    let end = len.saturating_sub(cut_end).max(start);
    (start.min(len), end.min(len))
}

/// Numeric-aware comparison: "file_2" sorts before "file_10".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut ia, mut ib) = (a.chars().peekable(), b.chars().peekable());
    loop {
        match (ia.peek().cloned(), ib.peek().cloned()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let mut na = String::new();
                while let Some(c) = ia.peek().cloned().filter(|c| c.is_ascii_digit()) {
                    na.push(c);
                    ia.next();
                }
                let mut nb = String::new();
                while let Some(c) = ib.peek().cloned().filter(|c| c.is_ascii_digit()) {
                    nb.push(c);
                    ib.next();
                }
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(ca), Some(cb)) => {
                if ca != cb {
                    return ca.cmp(&cb);
                }
                ia.next();
                ib.next();
            }
        }
    }
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(std_dev(&[4.0, 4.0, 4.0]), 0.0);
        assert!((std_dev(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-15);
        assert_eq!(nan_mean(&[1.0, f64::NAN, 3.0]), 2.0);
        assert!(nan_mean(&[f64::NAN]).is_nan());
        assert_eq!(argmax(&[1.0, f64::NAN, 5.0, 5.0, 2.0]), Some(2));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_interp() {
        let xs = [0.0, 1.0, 3.0];
        let ys = [0.0, 10.0, 30.0];
        assert_eq!(interp(0.5, &xs, &ys), 5.0);
        assert_eq!(interp(2.0, &xs, &ys), 20.0);
        assert_eq!(interp(0.0, &xs, &ys), 0.0);
        assert!(interp(3.5, &xs, &ys).is_nan());
    }

    #[test]
    fn test_trimmed_range() {
        assert_eq!(trimmed_range(100, 10.0, 20.0), (10, 80));
        assert_eq!(trimmed_range(10, 0.0, 0.0), (0, 10));
        assert_eq!(trimmed_range(10, 60.0, 60.0), (6, 6));
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["pix_10.txt", "pix_2.txt", "pix_1.txt", "pix_02b.txt"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["pix_1.txt", "pix_2.txt", "pix_02b.txt", "pix_10.txt"]);
    }
}
