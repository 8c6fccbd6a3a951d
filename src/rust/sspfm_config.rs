//! Per-run configuration records of the two stages.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::sspfm_electrostatic::ElectrostaticConfig;
use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_filter::FilterConfig;
use crate::sspfm_hysteresis::HysteresisConfig;
use crate::sspfm_phase::PhaseFlags;
use crate::sspfm_segment::{CutPercent, PeakFitConfig, ReductionConfig, ReductionMode};
use crate::sspfm_select::AnalysisMode;

closed_enum! {
    /// Source of the phase offset applied to each pixel.
    PhaseOffsetMethod, "phase offset method" {
        Static => "static",
        Dynamic => "dynamic",
        FileList => "file_list",
        NoOffset => "None",
    }
}

impl Default for PhaseOffsetMethod {
    fn default() -> Self {
        PhaseOffsetMethod::NoOffset
    }
}

/// `phase` block of the stage-1 configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseOffsetConfig {
    /// One offset per pixel, read in `file_list` mode.
    pub phase_file_path: Option<PathBuf>,
    pub method: PhaseOffsetMethod,
    /// Offset in `static` mode, and of the first pixel in `dynamic` mode.
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage1Config {
    pub mode: ReductionMode,
    pub cut_seg_percent: CutPercent,
    pub filter: FilterConfig,
    pub fit: PeakFitConfig,
    pub phase: PhaseOffsetConfig,
    pub input: PathBuf,
    pub sheet: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub verbose: bool,
    pub show_plots: bool,
    pub save: bool,
}

impl Default for Stage1Config {
    fn default() -> Self {
        Stage1Config {
            mode: ReductionMode::Dfrt,
            cut_seg_percent: CutPercent::default(),
            filter: FilterConfig::default(),
            fit: PeakFitConfig::default(),
            phase: PhaseOffsetConfig::default(),
            input: PathBuf::new(),
            sheet: None,
            output: None,
            verbose: false,
            show_plots: false,
            save: true,
        }
    }
}

impl Stage1Config {
    pub fn reduction(&self) -> ReductionConfig {
        ReductionConfig { cut: self.cut_seg_percent, filter: self.filter, fit: self.fit }
    }

    pub fn validate(&self) -> SspfmResult<()> {
        require_path("input", &self.input)?;
        if self.sheet.is_none() {
            return Err(SspfmError::config("sheet", "", &["path to the measurement sheet"]));
        }
        let cut = self.cut_seg_percent;
        if !(cut.start >= 0.0 && cut.end >= 0.0 && cut.start + cut.end < 100.0) {
            return Err(SspfmError::config(
                "cut_seg_percent",
                &format!("{}/{}", cut.start, cut.end),
                &["start, end >= 0 with start + end < 100"],
            ));
        }
        self.filter.validate()?;
        if self.phase.method == PhaseOffsetMethod::FileList && self.phase.phase_file_path.is_none() {
            return Err(SspfmError::config("phase_file_path", "", &["required by the file_list method"]));
        }
        Ok(())
    }

    /// Root of the stage outputs: `output`, or `<input>_out` next to the input folder.
    pub fn output_root(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| sibling_out(&self.input))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    #[serde(flatten)]
    pub flags: PhaseFlags,
    pub main_elec_file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage2Config {
    pub hysteresis: HysteresisConfig,
    pub phase: PhaseConfig,
    pub electrostatic: ElectrostaticConfig,
    /// Forced selection mode; chosen per channel when absent.
    pub analysis_mode: Option<AnalysisMode>,
    /// Stage-1 output root, holding the nanoloop folder.
    pub input: PathBuf,
    /// Measurement sheet giving the pixel grid; one row of pixels otherwise.
    pub sheet: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub verbose: bool,
    pub show_plots: bool,
    pub save: bool,
}

impl Default for Stage2Config {
    fn default() -> Self {
        Stage2Config {
            hysteresis: HysteresisConfig::default(),
            phase: PhaseConfig::default(),
            electrostatic: ElectrostaticConfig::default(),
            analysis_mode: None,
            input: PathBuf::new(),
            sheet: None,
            output: None,
            verbose: false,
            show_plots: false,
            save: true,
        }
    }
}

impl Stage2Config {
    pub fn validate(&self) -> SspfmResult<()> {
        require_path("input", &self.input)?;
        let h = &self.hysteresis;
        for (option, value) in [("inf_thresh", h.inf_thresh), ("sat_thresh", h.sat_thresh)] {
            // also rejects NaN
            if !(value > 0.0 && value < 100.0) {
                return Err(SspfmError::config(option, &value.to_string(), &["0 < percent < 100"]));
            }
        }
        Ok(())
    }

    /// Root of the stage outputs: `output`, or the stage-1 root itself.
    pub fn output_root(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| self.input.clone())
    }
}

fn require_path(option: &str, path: &Path) -> SspfmResult<()> {
    if path.as_os_str().is_empty() {
        Err(SspfmError::config(option, "", &["existing path"]))
    } else if !path.exists() {
        Err(SspfmError::config(option, &path.display().to_string(), &["existing path"]))
    } else {
        Ok(())
    }
}

fn sibling_out(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sspfm".to_string());
    input.with_file_name(format!("{}_out", name))
}

fn list_entries(filepath: &Path) -> SspfmResult<Vec<String>> {
    let content = fs::read_to_string(filepath)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_string())
        .collect())
}

/// Phase offsets, one per pixel, for the `file_list` method.
pub fn read_offset_table(filepath: &Path) -> SspfmResult<Vec<f64>> {
    list_entries(filepath)?
        .iter()
        .map(|l| {
            l.parse::<f64>()
                .map_err(|e| SspfmError::Parse(format!("{}: '{}': {}", filepath.display(), l, e)))
        })
        .collect()
}

pub fn read_main_elec_table(filepath: &Path) -> SspfmResult<Vec<bool>> {
    list_entries(filepath)?
        .iter()
        .map(|l| match l.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(SspfmError::config("main_elec", l, &["True", "False"])),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sspfm_filter::FilterType;
    use crate::sspfm_hysteresis::HystFunc;
    use crate::sspfm_phase::{CorrMode, LockedElecSlope};
    use crate::sspfm_properties::DomainMode;
    use crate::sspfm_read::load_record;
    use tempfile::tempdir;

    #[test]
    fn test_stage1_from_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stage1.toml");
        let input = dir.path().join("raw");
        fs::create_dir(&input).unwrap();
        let text = format!(
            "mode = \"max\"\ninput = \"{}\"\nsheet = \"sheet.toml\"\n\n[cut_seg_percent]\nstart = 10.0\n\n[filter]\ntype = \"low\"\nfreq1 = 5e3\n\n[phase]\nmethod = \"dynamic\"\noffset = 12.5\n",
            input.display()
        );
        fs::write(&path, text).unwrap();

        let config: Stage1Config = load_record(&path).unwrap();
        assert_eq!(config.mode, ReductionMode::Max);
        assert_eq!(config.cut_seg_percent.start, 10.0);
        assert_eq!(config.cut_seg_percent.end, 5.0);
        assert_eq!(config.filter.kind, FilterType::Low);
        assert_eq!(config.phase.method, PhaseOffsetMethod::Dynamic);
        assert!(config.save);
        config.validate().unwrap();
        assert_eq!(config.output_root(), dir.path().join("raw_out"));
    }

    #[test]
    fn test_stage1_rejections() {
        let err = toml::from_str::<Stage1Config>("mode = \"sweep\"").unwrap_err();
        assert!(err.to_string().contains("sweep"));

        let dir = tempdir().unwrap();
        let mut config = Stage1Config { input: dir.path().to_path_buf(), ..Stage1Config::default() };
        assert!(config.validate().unwrap_err().is_config());
        config.sheet = Some(dir.path().join("sheet.toml"));
        config.validate().unwrap();
        config.phase.method = PhaseOffsetMethod::FileList;
        assert!(config.validate().unwrap_err().is_config());
        config.phase.method = PhaseOffsetMethod::Static;
        config.cut_seg_percent = CutPercent { start: 60.0, end: 40.0 };
        assert!(config.validate().unwrap_err().is_config());

        let missing = Stage1Config { input: dir.path().join("nowhere"), ..Stage1Config::default() };
        assert!(missing.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_stage2_from_json() {
        let json = r#"{
            "hysteresis": {"func": "arctan", "del_1st_loop": false},
            "phase": {"corr": "affine", "fwd": 90.0, "rev": -90.0, "locked_elec_slope": "+"},
            "electrostatic": {"diff_mode": "set", "diff_domain": [-3.0, 3.0]},
            "analysis_mode": "mean_loop",
            "input": "."
        }"#;
        let config: Stage2Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.hysteresis.func, HystFunc::Arctan);
        assert!(!config.hysteresis.del_1st_loop);
        assert_eq!(config.phase.flags.corr, CorrMode::Affine);
        assert_eq!(config.phase.flags.pha_fwd, 90.0);
        assert_eq!(config.phase.flags.pha_rev, -90.0);
        assert_eq!(config.phase.flags.locked_elec_slope, LockedElecSlope::Positive);
        assert!(config.phase.flags.grounded_tip);
        assert_eq!(config.electrostatic.diff_mode, DomainMode::Set);
        assert_eq!(config.electrostatic.sat_mode, DomainMode::Auto);
        assert_eq!(config.analysis_mode, Some(AnalysisMode::MeanLoop));
        config.validate().unwrap();
        assert_eq!(config.output_root(), PathBuf::from("."));

        let mut bad = Stage2Config { input: PathBuf::from("."), ..Stage2Config::default() };
        bad.hysteresis.sat_thresh = 100.0;
        assert!(bad.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_per_pixel_tables() {
        let dir = tempdir().unwrap();
        let offsets = dir.path().join("offsets.txt");
        fs::write(&offsets, "# offsets\n10.5\n\n-20\n").unwrap();
        assert_eq!(read_offset_table(&offsets).unwrap(), vec![10.5, -20.0]);

        let elec = dir.path().join("main_elec.txt");
        fs::write(&elec, "True\nfalse\n1\n").unwrap();
        assert_eq!(read_main_elec_table(&elec).unwrap(), vec![true, false, true]);
        fs::write(&elec, "maybe\n").unwrap();
        assert!(read_main_elec_table(&elec).unwrap_err().is_config());
    }
}
