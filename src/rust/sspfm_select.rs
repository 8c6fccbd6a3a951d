use crate::sspfm_cut::FieldMode;
use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_hysteresis::{fit_hysteresis, HysteresisConfig, HysteresisFit};
use crate::sspfm_nanoloop::{mean_loop, shares_grid, Nanoloop};
use crate::sspfm_phase::PhaseCalibration;

closed_enum! {
    /// How the representative loop of a pixel is chosen.
    AnalysisMode, "analysis mode" {
        MultiLoop => "multi_loop",
        MeanLoop => "mean_loop",
        OnFLoop => "on_f_loop",
    }
}

impl AnalysisMode {
    /// Multi-loop selection for off-field data read at several voltages,
    /// averaging otherwise.
    pub fn auto(field: FieldMode, n_loops: usize) -> Self {
        match field {
            FieldMode::On => AnalysisMode::OnFLoop,
            FieldMode::Off if n_loops > 1 => AnalysisMode::MultiLoop,
            FieldMode::Off => AnalysisMode::MeanLoop,
        }
    }
}

/// Selected loop of one pixel and channel.
#[derive(Debug, Clone)]
pub struct BestLoop {
    pub mode: AnalysisMode,
    pub nanoloop: Nanoloop,
    pub read_volt: f64,
    /// `(read voltage, background)` of every candidate loop.
    pub bckgnd_tab: Vec<(f64, f64)>,
    /// Fit already computed during the selection.
    pub fit: Option<HysteresisFit>,
}

/// Whether the calibrated loop should run counterclockwise, i.e. whether the
/// high-bias state gives the larger piezoresponse.
pub fn counterclockwise(calibration: &PhaseCalibration) -> bool {
    let low = calibration.func.apply(1.0, calibration.target_pha_low);
    let high = calibration.func.apply(1.0, calibration.target_pha_high);
    if low.is_finite() && high.is_finite() && low != high {
        high > low
    } else {
        true
    }
}

pub fn select_loop(
    loops: &[Nanoloop],
    mode: AnalysisMode,
    field: FieldMode,
    config: &HysteresisConfig,
    counterclockwise: bool,
) -> SspfmResult<BestLoop> {
    if loops.is_empty() {
        return Err(SspfmError::Logic("No loop to select from".to_string()));
    }
    match mode {
        AnalysisMode::MultiLoop => multi_loop(loops, field, config, counterclockwise),
        AnalysisMode::MeanLoop | AnalysisMode::OnFLoop => {
            let nanoloop = if shares_grid(loops) {
                mean_loop(loops, config.del_1st_loop)?
            } else {
                // open mode: the widest loop spans the full write range
                widest(loops).clone()
            };
            let bckgnd_tab = loops
                .iter()
                .map(|l| {
                    let offset = fit_hysteresis(&l.left, &l.right, config, counterclockwise)
                        .map(|fit| fit.offset)
                        .unwrap_or(f64::NAN);
                    (l.read_volt, offset)
                })
                .collect();
            Ok(BestLoop { mode, read_volt: nanoloop.read_volt, nanoloop, bckgnd_tab, fit: None })
        }
    }
}

fn widest(loops: &[Nanoloop]) -> &Nanoloop {
    let span = |l: &Nanoloop| {
        let (lo, hi) = l.bias_range();
        hi - lo
    };
    let mut best = &loops[0];
    for l in &loops[1..] {
        if span(l) >= span(best) {
            best = l;
        }
    }
    best
}

/// Loop whose fitted background at its own read voltage lies closest to zero.
fn multi_loop(
    loops: &[Nanoloop],
    field: FieldMode,
    config: &HysteresisConfig,
    counterclockwise: bool,
) -> SspfmResult<BestLoop> {
    if field != FieldMode::Off || loops.len() < 2 {
        return Err(SspfmError::Logic(format!(
            "multi_loop needs several off field loops, got {} {} loop(s)",
            loops.len(),
            field.label()
        )));
    }
    let fits: Vec<Option<HysteresisFit>> = loops
        .iter()
        .map(|l| fit_hysteresis(&l.left, &l.right, config, counterclockwise).ok())
        .collect();
    let bckgnd_tab: Vec<(f64, f64)> = loops
        .iter()
        .zip(&fits)
        .map(|(l, fit)| (l.read_volt, fit.map_or(f64::NAN, |f| f.background(l.read_volt))))
        .collect();

    let best = bckgnd_tab
        .iter()
        .enumerate()
        .filter(|(_, (_, bg))| bg.is_finite())
        .min_by(|a, b| a.1 .1.abs().total_cmp(&b.1 .1.abs()))
        .map(|(i, _)| i)
        .ok_or_else(|| SspfmError::Fit("No loop could be fitted for multi_loop selection".to_string()))?;

    Ok(BestLoop {
        mode: AnalysisMode::MultiLoop,
        nanoloop: loops[best].clone(),
        read_volt: loops[best].read_volt,
        bckgnd_tab,
        fit: fits[best],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sspfm_hysteresis::tests::{generator, synthetic_rows};
    use crate::sspfm_phase::{bias_targets, PhaseFlags, PiezoFunc};

    fn loops_with_background(reads: &[f64]) -> Vec<Nanoloop> {
        let raw = PhaseCalibration::raw(PiezoFunc::Cos);
        reads
            .iter()
            .map(|&v| {
                // electrostatic background proportional to the read voltage
                let fit = generator(1.0, 3.0, -2.0, 2.0, 0.5 * v, 0.1 * v);
                Nanoloop::from_rows(&synthetic_rows(&fit, 41, 10.0, v), &raw)
            })
            .collect()
    }

    #[test]
    fn test_auto_mode() {
        assert_eq!(AnalysisMode::auto(FieldMode::Off, 5), AnalysisMode::MultiLoop);
        assert_eq!(AnalysisMode::auto(FieldMode::Off, 1), AnalysisMode::MeanLoop);
        assert_eq!(AnalysisMode::auto(FieldMode::On, 5), AnalysisMode::OnFLoop);
        assert!("single_loop".parse::<AnalysisMode>().is_err());
    }

    #[test]
    fn test_multi_loop_picks_background_nearest_zero() {
        let loops = loops_with_background(&[-2.0, -1.0, 0.0, 1.0, 2.0]);
        let best = select_loop(&loops, AnalysisMode::MultiLoop, FieldMode::Off, &HysteresisConfig::default(), true).unwrap();
        assert_eq!(best.read_volt, 0.0);
        assert_eq!(best.bckgnd_tab.len(), 5);
        assert!((best.bckgnd_tab[0].1 + 0.6).abs() < 1e-3, "{:?}", best.bckgnd_tab);
        let fit = best.fit.unwrap();
        assert!(fit.offset.abs() < 1e-4);
    }

    #[test]
    fn test_multi_loop_needs_off_field_loops() {
        let loops = loops_with_background(&[0.0]);
        let config = HysteresisConfig::default();
        assert!(select_loop(&loops, AnalysisMode::MultiLoop, FieldMode::Off, &config, true).is_err());
        let loops = loops_with_background(&[0.0, 1.0]);
        assert!(select_loop(&loops, AnalysisMode::MultiLoop, FieldMode::On, &config, true).is_err());
    }

    #[test]
    fn test_mean_loop_lists_offsets() {
        let loops = loops_with_background(&[1.0, 1.0, 1.0]);
        let config = HysteresisConfig::default();
        let best = select_loop(&loops, AnalysisMode::MeanLoop, FieldMode::Off, &config, true).unwrap();
        assert_eq!(best.read_volt, 1.0);
        assert!(best.fit.is_none());
        assert_eq!(best.nanoloop.write_volt, loops[0].write_volt);
        assert!(best.bckgnd_tab.iter().all(|(v, off)| *v == 1.0 && (off - 0.5).abs() < 1e-3));
    }

    #[test]
    fn test_open_mode_keeps_widest_loop() {
        let raw = PhaseCalibration::raw(PiezoFunc::Cos);
        let fit = generator(1.0, 3.0, -2.0, 2.0, 0.0, 0.0);
        let loops: Vec<Nanoloop> = [5.0, 10.0, 7.5]
            .iter()
            .map(|&v_max| Nanoloop::from_rows(&synthetic_rows(&fit, 21, v_max, 0.0), &raw))
            .collect();
        let best = select_loop(&loops, AnalysisMode::OnFLoop, FieldMode::On, &HysteresisConfig::default(), true).unwrap();
        assert_eq!(best.nanoloop.bias_range(), (-10.0, 10.0));
        assert!(best.nanoloop.piezorep_std.is_none());
        assert_eq!(best.bckgnd_tab.len(), 3);
    }

    #[test]
    fn test_counterclockwise_follows_targets() {
        let mut calibration = PhaseCalibration::raw(PiezoFunc::Cos);
        let (low, high) = bias_targets(FieldMode::Off, &PhaseFlags::default());
        calibration.target_pha_low = low;
        calibration.target_pha_high = high;
        assert!(counterclockwise(&calibration));
        calibration.target_pha_low = high;
        calibration.target_pha_high = low;
        assert!(!counterclockwise(&calibration));
    }
}
