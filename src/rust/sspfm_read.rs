use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_signal::SignalParams;
use crate::sspfm_utils::{mean, min_max};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sidebands {
    pub amp_l: Vec<f64>,
    pub pha_l: Vec<f64>,
    pub freq_l: Vec<f64>,
    pub amp_r: Vec<f64>,
    pub pha_r: Vec<f64>,
    pub freq_r: Vec<f64>,
}

/// Time-indexed channels of one pixel. Phase in degrees, frequency in kHz.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMeasurement {
    pub times: Vec<f64>,
    pub amp: Vec<f64>,
    pub pha: Vec<f64>,
    pub freq: Option<Vec<f64>>,
    pub sidebands: Option<Sidebands>,
    pub deflection: Option<Vec<f64>>,
    pub height: Option<Vec<f64>>,
    pub tip_bias: Option<Vec<f64>>,
    pub times_bias: Option<Vec<f64>>,
}

/// Canonical channel names understood by the table reader.
pub const CHANNELS: &[&str] = &[
    "times", "amp", "pha", "freq", "amp_sb_l", "pha_sb_l", "freq_sb_l", "amp_sb_r", "pha_sb_r",
    "freq_sb_r", "deflection", "height", "tip_bias", "times_bias",
];

impl RawMeasurement {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn validate(&self) -> SspfmResult<()> {
        let n = self.len();
        let mut channels: Vec<(&str, &Vec<f64>)> = vec![("amp", &self.amp), ("pha", &self.pha)];
        if let Some(freq) = &self.freq {
            channels.push(("freq", freq));
        }
        if let Some(sb) = &self.sidebands {
            channels.extend([
                ("amp_sb_l", &sb.amp_l),
                ("pha_sb_l", &sb.pha_l),
                ("freq_sb_l", &sb.freq_l),
                ("amp_sb_r", &sb.amp_r),
                ("pha_sb_r", &sb.pha_r),
                ("freq_sb_r", &sb.freq_r),
            ]);
        }
        for (name, channel) in [("deflection", &self.deflection), ("height", &self.height), ("tip_bias", &self.tip_bias)] {
            if let Some(channel) = channel {
                channels.push((name, channel));
            }
        }
        for (name, channel) in channels {
            if channel.len() != n {
                return Err(SspfmError::Ingest(format!(
                    "Channel '{}' holds {} samples, 'times' holds {}",
                    name,
                    channel.len(),
                    n
                )));
            }
        }
        Ok(())
    }

    pub fn phase_to_degrees(&mut self) {
        let convert = |values: &mut Vec<f64>| values.iter_mut().for_each(|v| *v = v.to_degrees());
        convert(&mut self.pha);
        if let Some(sb) = self.sidebands.as_mut() {
            convert(&mut sb.pha_l);
            convert(&mut sb.pha_r);
        }
    }

    /// Multiplies every amplitude channel by `factor` (nm per instrument unit).
    pub fn calibrate_amplitude(&mut self, factor: f64) {
        if factor == 1.0 {
            return;
        }
        let scale = |values: &mut Vec<f64>| values.iter_mut().for_each(|v| *v *= factor);
        scale(&mut self.amp);
        if let Some(sb) = self.sidebands.as_mut() {
            scale(&mut sb.amp_l);
            scale(&mut sb.amp_r);
        }
    }

    /// Topographic side properties: mean height, mean deflection and the
    /// deflection minimum used as adhesion proxy.
    pub fn aux_properties(&self) -> BTreeMap<String, f64> {
        let mut props = BTreeMap::new();
        if let Some(height) = &self.height {
            props.insert("height".to_string(), mean(height));
        }
        if let Some(deflection) = &self.deflection {
            props.insert("deflection".to_string(), mean(deflection));
            props.insert("adhesion".to_string(), min_max(deflection).0);
        }
        props
    }
}

/// How a tabular raw file is laid out.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLayout {
    pub delimiter: u8,
    /// Lines skipped before the column-title line.
    pub header_lines: usize,
    /// Canonical channel name to column title; unmapped channels use their own name.
    pub channels: HashMap<String, String>,
}

impl Default for TableLayout {
    fn default() -> Self {
        TableLayout { delimiter: b'\t', header_lines: 0, channels: HashMap::new() }
    }
}

impl TableLayout {
    fn column_title<'a>(&'a self, channel: &'a str) -> &'a str {
        self.channels.get(channel).map(String::as_str).unwrap_or(channel)
    }
}

/// Reads a `.txt`/`.csv` raw table into a `RawMeasurement`.
///
/// `times`, `amp` and `pha` are required; sidebands are kept only when all
/// six sideband columns are present.
pub fn read_table<P: AsRef<Path>>(filepath: P, layout: &TableLayout) -> SspfmResult<RawMeasurement> {
    let path = filepath.as_ref();
    let content = fs::read_to_string(path)?;
    let body: String = content
        .lines()
        .skip(layout.header_lines)
        .collect::<Vec<_>>()
        .join("\n");

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(layout.delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (col, field) in record.iter().enumerate().take(headers.len()) {
            let value = if field.is_empty() || field.eq_ignore_ascii_case("nan") {
                f64::NAN
            } else {
                field.parse::<f64>().map_err(|e| {
                    SspfmError::Ingest(format!(
                        "{}: row {}, column '{}': {}",
                        path.display(),
                        row + layout.header_lines + 2,
                        headers[col],
                        e
                    ))
                })?
            };
            // short rows leave the trailing columns short; validate() catches it
            columns[col].push(value);
        }
    }

    let take = |channel: &str| -> Option<Vec<f64>> {
        let title = layout.column_title(channel);
        headers
            .iter()
            .position(|h| h == title)
            .map(|idx| columns[idx].clone())
    };
    let require = |channel: &str| -> SspfmResult<Vec<f64>> {
        take(channel).ok_or_else(|| {
            SspfmError::Ingest(format!(
                "{}: required channel '{}' (column '{}') missing",
                path.display(),
                channel,
                layout.column_title(channel)
            ))
        })
    };

    // all six or nothing
    let sidebands = match (
        take("amp_sb_l"),
        take("pha_sb_l"),
        take("freq_sb_l"),
        take("amp_sb_r"),
        take("pha_sb_r"),
        take("freq_sb_r"),
    ) {
        (Some(amp_l), Some(pha_l), Some(freq_l), Some(amp_r), Some(pha_r), Some(freq_r)) => {
            Some(Sidebands { amp_l, pha_l, freq_l, amp_r, pha_r, freq_r })
        }
        _ => None,
    };

    let raw = RawMeasurement {
        times: require("times")?,
        amp: require("amp")?,
        pha: require("pha")?,
        freq: take("freq"),
        sidebands,
        deflection: take("deflection"),
        height: take("height"),
        tip_bias: take("tip_bias"),
        times_bias: take("times_bias"),
    };
    raw.validate()?;
    Ok(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grid {
    pub x_pix: usize,
    pub y_pix: usize,
    pub x_mic: f64,
    pub y_mic: f64,
}

impl Default for Grid {
    fn default() -> Self {
        Grid { x_pix: 1, y_pix: 1, x_mic: 1.0, y_mic: 1.0 }
    }
}

impl Grid {
    pub fn pixels(&self) -> usize {
        self.x_pix * self.y_pix
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSheet {
    pub grid: Grid,
    /// Amplitude calibration factor (nm per instrument unit).
    pub calibration_factor: f64,
    pub signal: SignalParams,
    pub metadata: BTreeMap<String, String>,
}

impl MeasurementSheet {
    pub fn calibration(&self) -> f64 {
        if self.calibration_factor > 0.0 {
            self.calibration_factor
        } else {
            1.0
        }
    }
}

/// Parses a TOML or JSON file (chosen by extension) into `T`.
pub fn load_record<T, P>(filepath: P) -> SspfmResult<T>
where
    T: serde::de::DeserializeOwned,
    P: AsRef<Path>,
{
    let path = filepath.as_ref();
    let content = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "json" => Ok(serde_json::from_str(&content)?),
        Some(ext) if ext == "toml" => Ok(toml::from_str(&content)?),
        other => Err(SspfmError::config(
            "record file extension",
            other.as_deref().unwrap_or(""),
            &["toml", "json"],
        )),
    }
}

pub fn list_raw_files(dir: &Path, extensions: &[&str]) -> SspfmResult<Vec<std::path::PathBuf>> {
    let mut files: Vec<std::path::PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
                .unwrap_or(false)
        })
        .collect();
    files.sort_by(|a, b| {
        crate::sspfm_utils::natural_cmp(&a.to_string_lossy(), &b.to_string_lossy())
    });
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_read_table_with_header_and_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pixel_1.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "instrument: demo").unwrap();
        writeln!(file, "date: today").unwrap();
        writeln!(file, "Time;Amplitude;Phase;height").unwrap();
        writeln!(file, "0.0;1.5;0.5;10").unwrap();
        writeln!(file, "0.1;2.5;1.0;12").unwrap();
        drop(file);

        let mut channels = HashMap::new();
        channels.insert("times".to_string(), "Time".to_string());
        channels.insert("amp".to_string(), "Amplitude".to_string());
        channels.insert("pha".to_string(), "Phase".to_string());
        let layout = TableLayout { delimiter: b';', header_lines: 2, channels };

        let raw = read_table(&path, &layout).unwrap();
        assert_eq!(raw.times, vec![0.0, 0.1]);
        assert_eq!(raw.amp, vec![1.5, 2.5]);
        assert!(raw.freq.is_none());
        assert!(raw.sidebands.is_none());
        assert_eq!(raw.aux_properties().get("height"), Some(&11.0));
    }

    #[test]
    fn test_read_table_missing_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pixel.txt");
        fs::write(&path, "times\tamp\n0\t1\n").unwrap();
        let err = read_table(&path, &TableLayout::default()).unwrap_err();
        assert!(err.to_string().contains("'pha'"));
    }

    #[test]
    fn test_phase_and_amplitude_conversion() {
        let mut raw = RawMeasurement {
            times: vec![0.0, 1.0],
            amp: vec![1.0, 2.0],
            pha: vec![std::f64::consts::PI, 0.0],
            deflection: Some(vec![-0.2, 0.4]),
            ..RawMeasurement::default()
        };
        raw.phase_to_degrees();
        raw.calibrate_amplitude(2.0);
        assert!((raw.pha[0] - 180.0).abs() < 1e-12);
        assert_eq!(raw.amp, vec![2.0, 4.0]);
        assert_eq!(raw.aux_properties().get("adhesion"), Some(&-0.2));
        assert!(raw.validate().is_ok());
        raw.pha.pop();
        assert!(raw.validate().is_err());
    }

    #[test]
    fn test_load_sheet_toml_and_json() {
        let dir = tempdir().unwrap();
        let toml_path = dir.path().join("sheet.toml");
        fs::write(
            &toml_path,
            "calibration_factor = 2.5\n[grid]\nx_pix = 3\ny_pix = 2\n[signal]\nn_w = 11\nmode_w = \"low up\"\n",
        )
        .unwrap();
        let sheet: MeasurementSheet = load_record(&toml_path).unwrap();
        assert_eq!(sheet.grid.pixels(), 6);
        assert_eq!(sheet.signal.n_w, 11);
        assert_eq!(sheet.calibration(), 2.5);

        let json_path = dir.path().join("sheet.json");
        fs::write(&json_path, r#"{"grid": {"x_pix": 4}, "signal": {"mode_r": "Low to High"}}"#).unwrap();
        let sheet: MeasurementSheet = load_record(&json_path).unwrap();
        assert_eq!(sheet.grid.x_pix, 4);
        assert_eq!(sheet.calibration(), 1.0);

        let bad = dir.path().join("sheet.json");
        fs::write(&bad, r#"{"signal": {"mode_w": "sideways"}}"#).unwrap();
        assert!(load_record::<MeasurementSheet, _>(&bad).is_err());
    }

    #[test]
    fn test_list_raw_files_natural_order() {
        let dir = tempdir().unwrap();
        for name in ["pix_10.txt", "pix_2.txt", "pix_1.csv", "notes.md"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let files = list_raw_files(dir.path(), &["txt", "csv"]).unwrap();
        let names: Vec<String> = files.iter().map(|p| crate::sspfm_utils::file_stem(p)).collect();
        assert_eq!(names, vec!["pix_1", "pix_2", "pix_10"]);
    }
}
