use plotters::prelude::*;
use plotters::style::full_palette::GREY;
use std::path::Path;

use crate::sspfm_hysteresis::{HysteresisFit, Side};
use crate::sspfm_nanoloop::Branch;
use crate::sspfm_select::BestLoop;
use crate::sspfm_utils::min_max;

fn finite_bounds(values: &[f64]) -> (f64, f64) {
    let (lo, hi) = min_max(values);
    if !lo.is_finite() || !hi.is_finite() {
        return (-1.0, 1.0);
    }
    let pad = if hi > lo { 0.05 * (hi - lo) } else { 1.0 };
    (lo - pad, hi + pad)
}

fn branch_points(branch: &Branch) -> Vec<(f64, f64)> {
    branch
        .write_volt
        .iter()
        .zip(&branch.piezorep)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect()
}

/// Renders the selected loop of a pixel, its fit and the fitted background.
pub fn plot_best_loop<P: AsRef<Path>>(
    output_path: P,
    title: &str,
    best: &BestLoop,
    fit: Option<&HysteresisFit>,
    size: (u32, u32),
) -> Result<(), Box<dyn std::error::Error>> {
    let output_path = output_path.as_ref().to_path_buf();
    let nanoloop = &best.nanoloop;
    let (x_min, x_max) = finite_bounds(&nanoloop.write_volt);
    let (y_min, y_max) = finite_bounds(&nanoloop.piezorep);

    let root = BitMapBackend::new(&output_path, size).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24).into_font())
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Write voltage [V]")
        .y_desc("Piezoresponse [a.u]")
        .x_label_style(("sans-serif", 18).into_font())
        .y_label_style(("sans-serif", 18).into_font())
        .draw()?;

    for (branch, color) in [(&nanoloop.left, BLUE), (&nanoloop.right, RED)] {
        let points = branch_points(branch);
        chart.draw_series(LineSeries::new(points.clone(), color.stroke_width(1)))?;
        chart.draw_series(points.into_iter().map(|p| Circle::new(p, 3, color.filled())))?;
    }

    if let Some(fit) = fit.filter(|f| f.is_valid()) {
        let steps = 400;
        let xs: Vec<f64> = (0..=steps)
            .map(|i| x_min + (x_max - x_min) * i as f64 / steps as f64)
            .collect();
        for side in Side::both() {
            chart
                .draw_series(LineSeries::new(xs.iter().map(|&x| (x, fit.eval(side, x))), BLACK.stroke_width(2)))?
                .label(format!("fit {}", side.suffix()))
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLACK.stroke_width(2)));
        }
        chart
            .draw_series(LineSeries::new(xs.iter().map(|&x| (x, fit.background(x))), GREY.stroke_width(1)))?
            .label("background")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], GREY.stroke_width(1)));
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;
    }

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sspfm_hysteresis::tests::{generator, synthetic_rows};
    use crate::sspfm_nanoloop::Nanoloop;
    use crate::sspfm_phase::{PhaseCalibration, PiezoFunc};
    use crate::sspfm_select::AnalysisMode;
    use tempfile::tempdir;

    #[test]
    fn test_plot_writes_png() {
        let dir = tempdir().unwrap();
        let fit = generator(1.0, 3.0, -2.0, 2.0, 0.1, 0.05);
        let nanoloop = Nanoloop::from_rows(&synthetic_rows(&fit, 21, 8.0, 0.0), &PhaseCalibration::raw(PiezoFunc::Cos));
        let best = BestLoop {
            mode: AnalysisMode::MeanLoop,
            read_volt: 0.0,
            bckgnd_tab: Vec::new(),
            fit: None,
            nanoloop,
        };
        let path = dir.path().join("loop.png");
        // headless hosts may lack a sans-serif font
        if plot_best_loop(&path, "pixel 0 off field", &best, Some(&fit), (640, 480)).is_ok() {
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
        }
    }
}
