//! Stage 1: raw measurement files to per-pixel nanoloop tables.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::sspfm_config::{read_offset_table, PhaseOffsetConfig, PhaseOffsetMethod, Stage1Config};
use crate::sspfm_cut::{cut, FieldMode};
use crate::sspfm_dispatch::{dispatch, PixelOutcome};
use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_logger::Logger;
use crate::sspfm_nanoloop::{nanoloop_file_name, write_nanoloop_file, LoopRow, NanoloopTable};
use crate::sspfm_output::{record_entries, write_parameters};
use crate::sspfm_phase::{apply_phase_offset, mean_offset, offset_from_histogram, HistoMethod};
use crate::sspfm_read::{list_raw_files, load_record, read_table, MeasurementSheet, RawMeasurement};
use crate::sspfm_segment::{reduce, ReductionConfig, ReductionMode, Segment};
use crate::sspfm_settings::Settings;
use crate::sspfm_signal::{generate, SignalParams};
use crate::sspfm_utils::file_stem;

pub const RAW_EXTENSIONS: [&str; 2] = ["txt", "csv"];

const PHA_MIN: f64 = -180.0;
const PHA_MAX: f64 = 180.0;

#[derive(Debug, Clone)]
pub struct PixelReduction {
    pub applied_offset: f64,
    /// Histogram offset of the reduced phases, when requested.
    pub measured_offset: Option<f64>,
    pub tables: Vec<(FieldMode, NanoloopTable)>,
    pub segment_errors: Vec<String>,
}

impl PixelReduction {
    pub fn table(&self, field: FieldMode) -> Option<&NanoloopTable> {
        self.tables.iter().find(|(f, _)| *f == field).map(|(_, t)| t)
    }
}

#[derive(Debug, Clone)]
pub struct ReducedPixel {
    pub index: usize,
    pub stem: String,
    pub reduction: PixelReduction,
}

#[derive(Debug)]
pub struct DatacubeRun {
    pub root: PathBuf,
    pub pixels: Vec<ReducedPixel>,
    pub skipped: Vec<(PathBuf, String)>,
    /// Set when a worker failed fatally; `pixels` is then partial.
    pub fatal: Option<SspfmError>,
}

/// Reads one raw file, converting phases to degrees and calibrating amplitudes.
pub fn load_pixel(path: &Path, settings: &Settings, sheet: &MeasurementSheet) -> SspfmResult<RawMeasurement> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("txt");
    let layout = settings.layout_for(extension)?;
    let mut raw = read_table(path, &layout)?;
    if settings.radians_input_phase {
        raw.phase_to_degrees();
    }
    raw.calibrate_amplitude(sheet.calibration());
    Ok(raw)
}

fn shift_phases(segments: &mut [Segment], offset: f64) -> Vec<f64> {
    let phases: Vec<f64> = segments.iter().map(|s| s.pha).collect();
    let shifted = apply_phase_offset(&phases, offset, PHA_MIN, PHA_MAX);
    for (segment, &pha) in segments.iter_mut().zip(&shifted) {
        segment.pha = pha;
    }
    shifted
}

/// Cuts, reduces and assembles one pixel into its on and off field tables.
///
/// The phase offset rotates the raw phase window before the reduction and
/// the reduced phases after it. With `histo` set the histogram offset of the
/// result is measured for the next pixel.
pub fn reduce_pixel(
    mut raw: RawMeasurement,
    signal: &SignalParams,
    mode: ReductionMode,
    reduction: &ReductionConfig,
    offset: f64,
    histo: Option<HistoMethod>,
) -> SspfmResult<PixelReduction> {
    let mut params = signal.clone();
    let seg_cut = cut(&mut params);
    let schedule = generate(&params)?;
    raw.pha = apply_phase_offset(&raw.pha, offset, PHA_MIN, PHA_MAX);
    let aux = raw.aux_properties();

    let mut tables = Vec::with_capacity(2);
    let mut segment_errors = Vec::new();
    let mut field_offsets = Vec::with_capacity(2);
    for field in FieldMode::both() {
        let infos = seg_cut.segment_infos(&params, &schedule, &raw.times, field, mode)?;
        let mut segments: Vec<Segment> = infos.iter().map(|info| reduce(info, &raw, reduction)).collect();
        let phases = shift_phases(&mut segments, offset);
        if let Some(method) = histo {
            field_offsets.push(offset_from_histogram(&phases, method));
        }
        segment_errors.extend(segments.iter().filter_map(|s| {
            s.error
                .as_ref()
                .map(|e| format!("{} segment {}: {}", field.label(), s.index, e))
        }));
        let rows: Vec<LoopRow> = segments.iter().map(LoopRow::from).collect();
        tables.push((field, NanoloopTable::new(rows, aux.clone())));
    }

    Ok(PixelReduction {
        applied_offset: offset,
        measured_offset: histo.map(|_| mean_offset(&field_offsets)),
        tables,
        segment_errors,
    })
}

/// Offset of every pixel; `dynamic` starts each run from the configured offset.
fn pixel_offsets(phase: &PhaseOffsetConfig, n_pixels: usize) -> SspfmResult<Vec<f64>> {
    match phase.method {
        PhaseOffsetMethod::Static | PhaseOffsetMethod::Dynamic => Ok(vec![phase.offset; n_pixels]),
        PhaseOffsetMethod::NoOffset => Ok(vec![0.0; n_pixels]),
        PhaseOffsetMethod::FileList => {
            let path = phase
                .phase_file_path
                .as_deref()
                .ok_or_else(|| SspfmError::config("phase_file_path", "", &["required by the file_list method"]))?;
            let offsets = read_offset_table(path)?;
            if offsets.len() < n_pixels {
                let needed = format!("at least {} offsets", n_pixels);
                return Err(SspfmError::config(
                    "phase_file_path",
                    &format!("{} ({} offsets)", path.display(), offsets.len()),
                    &[needed.as_str()],
                ));
            }
            Ok(offsets)
        }
    }
}

pub fn run_datacube(config: &Stage1Config, settings: &Settings, logger: &Logger) -> SspfmResult<DatacubeRun> {
    let start = Local::now();
    config.validate()?;
    let sheet_path = config
        .sheet
        .as_deref()
        .ok_or_else(|| SspfmError::config("sheet", "", &["path to the measurement sheet"]))?;
    let sheet: MeasurementSheet = load_record(sheet_path)?;
    sheet.signal.validate()?;

    let files = list_raw_files(&config.input, &RAW_EXTENSIONS)?;
    if files.is_empty() {
        return Err(SspfmError::config(
            "input",
            &config.input.display().to_string(),
            &["folder holding .txt or .csv raw files"],
        ));
    }
    let root = config.output_root();
    let nanoloop_dir = root.join(&settings.folders.nanoloops);
    if config.save {
        fs::create_dir_all(&nanoloop_dir)?;
    }

    let offsets = pixel_offsets(&config.phase, files.len())?;
    let dynamic = config.phase.method == PhaseOffsetMethod::Dynamic;
    if dynamic && settings.multi_processing {
        logger.warn(format_args!("dynamic phase offset runs pixels sequentially, multi_processing ignored"));
    }
    let parallel = settings.multi_processing && !dynamic;
    let histo = if dynamic { Some(settings.histo_method) } else { None };
    let reduction = config.reduction();
    let carried = Mutex::new(config.phase.offset);

    logger.log_fmt(format_args!(
        "Stage 1: {} raw file(s) in {}, mode {}, phase offset {}",
        files.len(),
        config.input.display(),
        config.mode,
        config.phase.method
    ));
    if sheet.grid.pixels() != files.len() {
        logger.warn(format_args!(
            "grid holds {} pixels but {} raw files were found",
            sheet.grid.pixels(),
            files.len()
        ));
    }

    let run = dispatch(files.len(), parallel, settings.workers, |index| {
        let path = &files[index];
        let stem = file_stem(path);
        let offset = if dynamic {
            match carried.lock() {
                Ok(guard) => *guard,
                Err(poisoned) => *poisoned.into_inner(),
            }
        } else {
            offsets[index]
        };

        let reduced = load_pixel(path, settings, &sheet)
            .and_then(|raw| reduce_pixel(raw, &sheet.signal, config.mode, &reduction, offset, histo));
        let reduced = match reduced {
            Ok(reduced) => reduced,
            Err(e) => return PixelOutcome::Skipped(e.to_string()),
        };
        if let Some(measured) = reduced.measured_offset.filter(|m| m.is_finite()) {
            let mut guard = match carried.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = measured;
        }

        if settings.detect_bug_segments && !reduced.segment_errors.is_empty() {
            logger.log_fmt(format_args!("{}: {} segment(s) failed", stem, reduced.segment_errors.len()));
        }
        if logger.is_verbose() || settings.detect_bug_segments {
            for error in &reduced.segment_errors {
                logger.log_fmt(format_args!("{}: {}", stem, error));
            }
        }
        if config.save {
            for (field, table) in &reduced.tables {
                if let Err(e) = write_nanoloop_file(nanoloop_dir.join(nanoloop_file_name(&stem, *field)), table) {
                    return PixelOutcome::Fatal(e);
                }
            }
        }
        logger.log_verbose(format_args!("pixel {} ({}) reduced, phase offset {:.2} deg", index, stem, offset));
        PixelOutcome::Done(ReducedPixel { index, stem, reduction: reduced })
    })?;

    let skipped: Vec<(PathBuf, String)> = run
        .skipped
        .into_iter()
        .map(|(index, reason)| (files[index].clone(), reason))
        .collect();
    for (path, reason) in &skipped {
        logger.warn(format_args!("{} skipped: {}", path.display(), reason));
    }
    if let Some(e) = &run.fatal {
        logger.log_fmt(format_args!("Stage 1 aborted: {}", e));
    }
    let pixels: Vec<ReducedPixel> = run.done.into_iter().map(|(_, pixel)| pixel).collect();

    let end = Local::now();
    if config.save {
        let summary = vec![
            ("raw files".to_string(), files.len().to_string()),
            ("reduced pixels".to_string(), pixels.len().to_string()),
            ("skipped files".to_string(), skipped.len().to_string()),
        ];
        write_parameters(
            root.join("parameters.txt"),
            start,
            end,
            &[
                ("Stage 1 configuration", record_entries(config)?),
                ("Measurement sheet", record_entries(&sheet)?),
                ("Settings", record_entries(settings)?),
                ("Summary", summary),
            ],
        )?;
    }
    logger.log_fmt(format_args!(
        "Stage 1 done: {} pixel(s) reduced, {} skipped, {:.3} s",
        pixels.len(),
        skipped.len(),
        end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0
    ));

    Ok(DatacubeRun { root, pixels, skipped, fatal: run.fatal })
}
