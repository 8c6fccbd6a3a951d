use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use sspfm::sspfm_analysis::run_nanoloop;
use sspfm::sspfm_config::{PhaseOffsetMethod, Stage1Config, Stage2Config};
use sspfm::sspfm_datacube::run_datacube;
use sspfm::sspfm_error::SspfmResult;
use sspfm::sspfm_hysteresis::HystFunc;
use sspfm::sspfm_logger::Logger;
use sspfm::sspfm_read::load_record;
use sspfm::sspfm_segment::ReductionMode;
use sspfm::sspfm_select::AnalysisMode;
use sspfm::sspfm_settings::Settings;

/// Switching spectroscopy PFM processing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Stage 1 (datacube) turns raw measurement files into nanoloop tables,
stage 2 (nanoloop) turns nanoloop tables into property maps.
Exit status: 0 success, 1 processing error, 2 invalid configuration")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct Common {
    /// Run configuration file (TOML or JSON, defaults otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Settings file (TOML or JSON, built-in settings otherwise)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Input folder (overrides the configuration file)
    #[arg(short, long, aliases = ["in", "inp"])]
    input: Option<PathBuf>,

    /// Output folder (overrides the configuration file)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Measurement sheet (overrides the configuration file)
    #[arg(long)]
    sheet: Option<PathBuf>,

    /// Print per-pixel details
    #[arg(short, long)]
    verbose: bool,

    /// Render figures of the analysed loops (stage 2)
    #[arg(long)]
    show_plots: bool,

    /// Run without writing result files
    #[arg(long)]
    no_save: bool,

    /// Process pixels on this many worker threads (0: one per core)
    #[arg(long)]
    workers: Option<usize>,

    /// Append console messages to this file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Suppress console output (file output if --log is specified)
    #[arg(long)]
    noconsole: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage 1: raw measurement files to nanoloop tables
    Datacube {
        #[command(flatten)]
        common: Common,

        /// Segment reduction mode (max, fit, single_freq, dfrt)
        #[arg(long)]
        mode: Option<String>,

        /// Phase offset method (static, dynamic, file_list, None)
        #[arg(long)]
        phase_method: Option<String>,

        /// Phase offset in degrees for the static and dynamic methods
        #[arg(long, allow_negative_numbers = true)]
        phase_offset: Option<f64>,
    },
    /// Stage 2: nanoloop tables to hysteresis and electrostatic property maps
    Nanoloop {
        #[command(flatten)]
        common: Common,

        /// Hysteresis function (sigmoid, arctan)
        #[arg(long)]
        func: Option<String>,

        /// Loop selection (multi_loop, mean_loop, on_f_loop)
        #[arg(long)]
        analysis_mode: Option<String>,
    },
}

fn load_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> SspfmResult<T> {
    match path {
        Some(path) => load_record(path),
        None => Ok(T::default()),
    }
}

fn load_settings(common: &Common) -> SspfmResult<Settings> {
    let mut settings = Settings::load(common.settings.as_deref())?;
    if let Some(workers) = common.workers {
        settings.multi_processing = true;
        settings.workers = workers;
    }
    Ok(settings)
}

fn setup_logger(common: &Common, verbose: bool) -> SspfmResult<Logger> {
    let mut logger = Logger::new();
    if let Some(log) = &common.log {
        if let Some(parent) = log.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }
    logger.setup(!common.noconsole, common.log.is_some(), common.log.as_deref())?;
    logger.set_verbose(verbose);
    Ok(logger)
}

/// Returns false when the run stopped on a fatal worker error.
fn datacube_command(
    common: &Common,
    mode: Option<&str>,
    phase_method: Option<&str>,
    phase_offset: Option<f64>,
) -> SspfmResult<bool> {
    let mut config: Stage1Config = load_or_default(common.config.as_deref())?;
    if let Some(input) = &common.input {
        config.input = input.clone();
    }
    if let Some(output) = &common.output {
        config.output = Some(output.clone());
    }
    if let Some(sheet) = &common.sheet {
        config.sheet = Some(sheet.clone());
    }
    if let Some(mode) = mode {
        config.mode = mode.parse::<ReductionMode>()?;
    }
    if let Some(method) = phase_method {
        config.phase.method = method.parse::<PhaseOffsetMethod>()?;
    }
    if let Some(offset) = phase_offset {
        config.phase.offset = offset;
    }
    config.verbose |= common.verbose;
    config.show_plots |= common.show_plots;
    config.save &= !common.no_save;

    let settings = load_settings(common)?;
    let logger = setup_logger(common, config.verbose)?;
    let run = run_datacube(&config, &settings, &logger)?;

    logger.log_fmt(format_args!(
        "datacube: {} pixel(s) reduced, {} skipped",
        run.pixels.len(),
        run.skipped.len()
    ));
    if config.save {
        logger.log_fmt(format_args!("nanoloops written under {}", run.root.display()));
    }
    match &run.fatal {
        Some(e) => {
            logger.log_fmt(format_args!("Error: run aborted: {}", e));
            Ok(false)
        }
        None => Ok(true),
    }
}

fn nanoloop_command(common: &Common, func: Option<&str>, analysis_mode: Option<&str>) -> SspfmResult<bool> {
    let mut config: Stage2Config = load_or_default(common.config.as_deref())?;
    if let Some(input) = &common.input {
        config.input = input.clone();
    }
    if let Some(output) = &common.output {
        config.output = Some(output.clone());
    }
    if let Some(sheet) = &common.sheet {
        config.sheet = Some(sheet.clone());
    }
    if let Some(func) = func {
        config.hysteresis.func = func.parse::<HystFunc>()?;
    }
    if let Some(mode) = analysis_mode {
        config.analysis_mode = Some(mode.parse::<AnalysisMode>()?);
    }
    config.verbose |= common.verbose;
    config.show_plots |= common.show_plots;
    config.save &= !common.no_save;

    let settings = load_settings(common)?;
    let logger = setup_logger(common, config.verbose)?;
    let run = run_nanoloop(&config, &settings, &logger)?;

    logger.log_fmt(format_args!(
        "nanoloop: {} pixel(s) analysed, {} skipped, {} property map(s)",
        run.pixels.len(),
        run.skipped.len(),
        run.properties.len()
    ));
    if config.save {
        logger.log_fmt(format_args!("properties written under {}", run.root.display()));
    }
    match &run.fatal {
        Some(e) => {
            logger.log_fmt(format_args!("Error: run aborted: {}", e));
            Ok(false)
        }
        None => Ok(true),
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // If no arguments are provided, print help and exit
            if std::env::args().len() <= 1 {
                let mut cmd = Args::command();
                if cmd.print_help().is_err() {
                    std::process::exit(1);
                }
                std::process::exit(0);
            } else {
                e.exit();
            }
        }
    };

    let result = match &args.command {
        Command::Datacube { common, mode, phase_method, phase_offset } => {
            datacube_command(common, mode.as_deref(), phase_method.as_deref(), *phase_offset)
        }
        Command::Nanoloop { common, func, analysis_mode } => {
            nanoloop_command(common, func.as_deref(), analysis_mode.as_deref())
        }
    };

    let code = match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_config() {
                2
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}
