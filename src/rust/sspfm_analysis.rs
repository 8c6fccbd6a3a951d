//! Stage 2: nanoloop tables to per-pixel property maps.

use chrono::Local;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::sspfm_config::{read_main_elec_table, Stage2Config};
use crate::sspfm_cut::FieldMode;
use crate::sspfm_dispatch::{dispatch, PixelOutcome};
use crate::sspfm_electrostatic::{
    differential_analysis, differential_domain, offset_analysis, saturation_analysis, saturation_domain,
    ElectrostaticConfig,
};
use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_hysteresis::{fit_hysteresis, HysteresisFit};
use crate::sspfm_logger::Logger;
use crate::sspfm_nanoloop::{build_loops, nanoloop_file_name, parse_file_name, read_nanoloop_file, NanoloopTable};
use crate::sspfm_output::{record_entries, write_best_loop, write_parameters, write_property_files, PropertyMap};
use crate::sspfm_phase::{calibrate, HistoMethod, PhaseCalibration, PhaseFlags};
use crate::sspfm_plot::plot_best_loop;
use crate::sspfm_properties::loop_properties;
use crate::sspfm_read::{list_raw_files, load_record, Grid, MeasurementSheet};
use crate::sspfm_select::{counterclockwise, select_loop, AnalysisMode, BestLoop};
use crate::sspfm_settings::Settings;

pub const COUPLED_MODE: &str = "coupled";
pub const OTHER_MODE: &str = "other";

/// Nanoloop files of one pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelFiles {
    pub stem: String,
    pub files: Vec<(FieldMode, PathBuf)>,
}

/// Groups `<stem>_<on_f|off_f>.txt` files by pixel, in natural order of the stems.
pub fn collect_pixels(dir: &Path) -> SspfmResult<Vec<PixelFiles>> {
    let mut pixels: Vec<PixelFiles> = Vec::new();
    for path in list_raw_files(dir, &["txt"])? {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let Some((stem, field)) = parse_file_name(&name) else {
            continue;
        };
        match pixels.iter_mut().find(|p| p.stem == stem) {
            Some(pixel) => pixel.files.push((field, path)),
            None => pixels.push(PixelFiles { stem, files: vec![(field, path)] }),
        }
    }
    pixels.sort_by(|a, b| crate::sspfm_utils::natural_cmp(&a.stem, &b.stem));
    Ok(pixels)
}

/// Nanoloop folder under a stage-1 root, or the root itself when it holds the files.
pub fn nanoloop_folder(input: &Path, settings: &Settings) -> PathBuf {
    let nested = input.join(&settings.folders.nanoloops);
    if nested.is_dir() {
        nested
    } else {
        input.to_path_buf()
    }
}

/// Analysis of one field mode of a pixel.
#[derive(Debug, Clone)]
pub struct ChannelAnalysis {
    pub field: FieldMode,
    pub calibration: PhaseCalibration,
    pub best: BestLoop,
    /// All NaN when the fit failed.
    pub fit: HysteresisFit,
    pub properties: Vec<(String, f64)>,
    pub notes: Vec<String>,
}

/// Selection mode for a channel, falling back to the automatic choice when
/// the requested one does not apply.
fn channel_mode(requested: Option<AnalysisMode>, field: FieldMode, n_loops: usize, notes: &mut Vec<String>) -> AnalysisMode {
    let auto = AnalysisMode::auto(field, n_loops);
    match requested {
        Some(AnalysisMode::MultiLoop) if auto != AnalysisMode::MultiLoop => {
            notes.push(format!(
                "{}: multi_loop needs several off field loops, {} used",
                field.label(),
                auto
            ));
            auto
        }
        Some(mode) => mode,
        None => auto,
    }
}

pub fn analyze_channel(
    table: &NanoloopTable,
    field: FieldMode,
    flags: &PhaseFlags,
    config: &Stage2Config,
    histo_method: HistoMethod,
) -> SspfmResult<ChannelAnalysis> {
    let mut notes = Vec::new();
    let calibration = calibrate(&table.phases(), &table.write_voltages(), field, flags, histo_method, -180.0);
    if let Some(note) = &calibration.fallback {
        notes.push(note.clone());
    }
    let loops = build_loops(table, &calibration)?;
    let mode = channel_mode(config.analysis_mode, field, loops.len(), &mut notes);
    let ccw = counterclockwise(&calibration);
    let hyst = &config.hysteresis;
    let best = select_loop(&loops, mode, field, hyst, ccw)?;

    let fit = match best.fit {
        Some(fit) => fit,
        None => fit_hysteresis(&best.nanoloop.left, &best.nanoloop.right, hyst, ccw).unwrap_or_else(|e| {
            notes.push(format!("{} loop fit failed: {}", field.label(), e));
            HysteresisFit::nan(hyst.func, hyst.asymmetric)
        }),
    };

    let sat = config.electrostatic.sat();
    let mut properties = loop_properties(&fit, best.nanoloop.bias_range(), hyst, &sat);
    if field == FieldMode::On {
        let domain = saturation_domain(&fit, hyst, &sat);
        properties.extend(saturation_analysis(&best.nanoloop, domain).properties());
    }
    properties.extend(offset_analysis(&fit));
    properties.push(("best loop: read volt".to_string(), best.read_volt));

    Ok(ChannelAnalysis { field, calibration, best, fit, properties, notes })
}

/// Differential analysis of the on and off field best loops of one pixel.
pub fn coupled_properties(
    on: &ChannelAnalysis,
    off: &ChannelAnalysis,
    electrostatic: &ElectrostaticConfig,
    subtract_offset: bool,
) -> SspfmResult<Vec<(String, f64)>> {
    let offset_off = if subtract_offset && off.fit.offset.is_finite() { off.fit.offset } else { 0.0 };
    let domain = differential_domain(&on.best.nanoloop, &electrostatic.diff());
    Ok(differential_analysis(&on.best.nanoloop, &off.best.nanoloop, offset_off, domain)?.properties())
}

#[derive(Debug, Clone)]
pub struct PixelAnalysis {
    pub index: usize,
    pub stem: String,
    pub channels: Vec<ChannelAnalysis>,
    pub coupled: Option<Vec<(String, f64)>>,
    /// Topographic properties forwarded from the nanoloop headers.
    pub other_properties: BTreeMap<String, f64>,
    /// Channel files that could not be read.
    pub unreadable: Vec<(FieldMode, String)>,
    pub notes: Vec<String>,
}

impl PixelAnalysis {
    pub fn channel(&self, field: FieldMode) -> Option<&ChannelAnalysis> {
        self.channels.iter().find(|c| c.field == field)
    }

    fn fill(&self, map: &mut PropertyMap) {
        for channel in &self.channels {
            map.extend(self.index, channel.field.as_str(), channel.properties.iter().cloned());
        }
        if let Some(coupled) = &self.coupled {
            map.extend(self.index, COUPLED_MODE, coupled.iter().cloned());
        }
        map.extend(self.index, OTHER_MODE, self.other_properties.iter().map(|(k, v)| (k.clone(), *v)));
    }
}

/// Analyses every channel of a pixel. A failing channel is noted and left
/// out; the pixel fails only when no channel could be analysed.
pub fn analyze_pixel(
    pixel: &PixelFiles,
    index: usize,
    flags: &PhaseFlags,
    config: &Stage2Config,
    settings: &Settings,
) -> SspfmResult<PixelAnalysis> {
    let mut notes = Vec::new();
    let mut channels = Vec::new();
    let mut other_properties = BTreeMap::new();
    let mut unreadable = Vec::new();
    for field in FieldMode::both() {
        let Some((_, path)) = pixel.files.iter().find(|(f, _)| *f == field) else {
            continue;
        };
        let table = match read_nanoloop_file(path) {
            Ok(table) => table,
            Err(e) => {
                unreadable.push((field, format!("{}: {}", path.display(), e)));
                continue;
            }
        };
        for (key, value) in &table.other_properties {
            other_properties.entry(key.clone()).or_insert(*value);
        }
        match analyze_channel(&table, field, flags, config, settings.histo_method) {
            Ok(channel) => {
                notes.extend(channel.notes.iter().cloned());
                channels.push(channel);
            }
            Err(e) => notes.push(format!("{} channel: {}", field.label(), e)),
        }
    }
    if channels.is_empty() {
        let mut reasons: Vec<String> = unreadable.iter().map(|(_, e)| e.clone()).collect();
        reasons.extend(notes);
        return Err(SspfmError::Fit(format!("no channel could be analysed ({})", reasons.join("; "))));
    }

    let on = channels.iter().find(|c| c.field == FieldMode::On);
    let off = channels.iter().find(|c| c.field == FieldMode::Off);
    let coupled = match (on, off) {
        (Some(on), Some(off)) => {
            match coupled_properties(on, off, &config.electrostatic, settings.electrostatic_offset) {
                Ok(props) => Some(props),
                Err(e) => {
                    notes.push(format!("coupled analysis: {}", e));
                    None
                }
            }
        }
        _ => None,
    };

    Ok(PixelAnalysis { index, stem: pixel.stem.clone(), channels, coupled, other_properties, unreadable, notes })
}

fn save_pixel(analysis: &PixelAnalysis, best_dir: &Path) -> SspfmResult<()> {
    for channel in &analysis.channels {
        let fit = Some(&channel.fit).filter(|f| f.is_valid());
        write_best_loop(best_dir.join(nanoloop_file_name(&analysis.stem, channel.field)), &channel.best, fit)?;
    }
    Ok(())
}

fn plot_pixel(analysis: &PixelAnalysis, fig_dir: &Path, size: (u32, u32), logger: &Logger) {
    for channel in &analysis.channels {
        let path = fig_dir.join(format!("{}_{}.png", analysis.stem, channel.field.as_str()));
        let title = format!("{} {}", analysis.stem, channel.field.label());
        let fit = Some(&channel.fit).filter(|f| f.is_valid());
        if let Err(e) = plot_best_loop(&path, &title, &channel.best, fit, size) {
            logger.warn(format_args!("figure {} not drawn: {}", path.display(), e));
        }
    }
}

#[derive(Debug)]
pub struct NanoloopRun {
    pub root: PathBuf,
    pub properties: PropertyMap,
    pub pixels: Vec<PixelAnalysis>,
    pub skipped: Vec<(String, String)>,
    /// Set when a worker failed fatally; the aggregate is then partial.
    pub fatal: Option<SspfmError>,
}

pub fn run_nanoloop(config: &Stage2Config, settings: &Settings, logger: &Logger) -> SspfmResult<NanoloopRun> {
    let start = Local::now();
    config.validate()?;
    let nanoloop_dir = nanoloop_folder(&config.input, settings);
    let pixels = collect_pixels(&nanoloop_dir)?;
    if pixels.is_empty() {
        return Err(SspfmError::config(
            "input",
            &nanoloop_dir.display().to_string(),
            &["folder holding <pixel>_on_f.txt / <pixel>_off_f.txt nanoloop files"],
        ));
    }

    let grid = match &config.sheet {
        Some(path) => load_record::<MeasurementSheet, _>(path)?.grid,
        None => Grid { x_pix: pixels.len(), y_pix: 1, ..Grid::default() },
    };
    let main_elec = match &config.phase.main_elec_file_path {
        Some(path) => {
            let table = read_main_elec_table(path)?;
            if table.len() < pixels.len() {
                let needed = format!("at least {} entries", pixels.len());
                return Err(SspfmError::config(
                    "main_elec_file_path",
                    &format!("{} ({} entries)", path.display(), table.len()),
                    &[needed.as_str()],
                ));
            }
            Some(table)
        }
        None => None,
    };

    let root = config.output_root();
    let best_dir = root.join(&settings.folders.best_nanoloops);
    let fig_dir = root.join(&settings.folders.figures);
    let prop_dir = root.join(&settings.folders.properties);
    let draw = config.save && config.show_plots;
    if config.save {
        fs::create_dir_all(&best_dir)?;
        fs::create_dir_all(&prop_dir)?;
    }
    if draw {
        fs::create_dir_all(&fig_dir)?;
    }
    let size = (settings.figsize[0], settings.figsize[1]);

    logger.log_fmt(format_args!(
        "Stage 2: {} pixel(s) in {}, function {}",
        pixels.len(),
        nanoloop_dir.display(),
        config.hysteresis.func
    ));

    let run = dispatch(pixels.len(), settings.multi_processing, settings.workers, |index| {
        let pixel = &pixels[index];
        let mut flags = config.phase.flags;
        if let Some(table) = &main_elec {
            flags.main_elec = table[index];
        }
        let analysis = match analyze_pixel(pixel, index, &flags, config, settings) {
            Ok(analysis) => analysis,
            Err(e) => return PixelOutcome::Skipped(e.to_string()),
        };
        for (field, error) in &analysis.unreadable {
            logger.warn(format_args!("{} {} left out: {}", analysis.stem, field.label(), error));
        }
        for note in &analysis.notes {
            logger.log_fmt(format_args!("{}: {}", analysis.stem, note));
        }
        if config.save {
            if let Err(e) = save_pixel(&analysis, &best_dir) {
                return PixelOutcome::Fatal(e);
            }
        }
        if draw {
            plot_pixel(&analysis, &fig_dir, size, logger);
        }
        logger.log_verbose(format_args!("pixel {} ({}) analysed", index, analysis.stem));
        PixelOutcome::Done(analysis)
    })?;

    let skipped: Vec<(String, String)> = run
        .skipped
        .into_iter()
        .map(|(index, reason)| (pixels[index].stem.clone(), reason))
        .collect();
    for (stem, reason) in &skipped {
        logger.warn(format_args!("pixel {} skipped: {}", stem, reason));
    }
    if let Some(e) = &run.fatal {
        logger.log_fmt(format_args!("Stage 2 aborted: {}", e));
    }
    let analyses: Vec<PixelAnalysis> = run.done.into_iter().map(|(_, analysis)| analysis).collect();

    let mut properties = PropertyMap::new(grid);
    for analysis in &analyses {
        analysis.fill(&mut properties);
    }

    let end = Local::now();
    if config.save {
        write_property_files(&prop_dir, &properties)?;
        let summary = vec![
            ("pixels".to_string(), pixels.len().to_string()),
            ("analysed pixels".to_string(), analyses.len().to_string()),
            ("skipped pixels".to_string(), skipped.len().to_string()),
        ];
        write_parameters(
            prop_dir.join("parameters.txt"),
            start,
            end,
            &[
                ("Stage 2 configuration", record_entries(config)?),
                ("Settings", record_entries(settings)?),
                ("Summary", summary),
            ],
        )?;
    }
    logger.log_fmt(format_args!(
        "Stage 2 done: {} pixel(s) analysed, {} skipped, {:.3} s",
        analyses.len(),
        skipped.len(),
        end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0
    ));

    Ok(NanoloopRun { root, properties, pixels: analyses, skipped, fatal: run.fatal })
}
