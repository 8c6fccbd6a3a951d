use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_hysteresis::{HysteresisFit, Side};
use crate::sspfm_read::Grid;
use crate::sspfm_select::BestLoop;

const DELIMITER: &str = "\t\t";

/// Per-pixel property maps, keyed by measurement mode then property name.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMap {
    pub grid: Grid,
    pub values: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
}

impl PropertyMap {
    pub fn new(grid: Grid) -> Self {
        PropertyMap { grid, values: BTreeMap::new() }
    }

    /// Stores one pixel value; pixels never set stay NaN.
    pub fn insert(&mut self, pixel: usize, mode: &str, key: &str, value: f64) {
        let n = self.grid.pixels().max(pixel + 1);
        let column = self
            .values
            .entry(mode.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| vec![f64::NAN; n]);
        if column.len() <= pixel {
            column.resize(pixel + 1, f64::NAN);
        }
        column[pixel] = value;
    }

    pub fn extend<I: IntoIterator<Item = (String, f64)>>(&mut self, pixel: usize, mode: &str, props: I) {
        for (key, value) in props {
            self.insert(pixel, mode, &key, value);
        }
    }

    pub fn get(&self, mode: &str, key: &str) -> Option<&[f64]> {
        self.values.get(mode)?.get(key).map(Vec::as_slice)
    }

    /// Number of maps over all modes.
    pub fn len(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn merge(&mut self, other: PropertyMap) {
        for (mode, keys) in other.values {
            for (key, column) in keys {
                for (pixel, value) in column.into_iter().enumerate() {
                    if !value.is_nan() {
                        self.insert(pixel, &mode, &key, value);
                    }
                }
            }
        }
    }
}

/// `<mode>_<key>.txt`, with separators turned into underscores.
pub fn property_file_name(mode: &str, key: &str) -> String {
    let key: String = key
        .chars()
        .filter(|c| *c != ':')
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    format!("{}_{}.txt", mode, key)
}

/// Writes one file per property under `dir`, values in row-major pixel order.
pub fn write_property_files(dir: &Path, map: &PropertyMap) -> SspfmResult<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let g = &map.grid;
    let width = g.x_pix.max(1);
    let mut written = Vec::new();
    for (mode, keys) in &map.values {
        for (key, column) in keys {
            let path = dir.join(property_file_name(mode, key));
            let mut writer = BufWriter::new(File::create(&path)?);
            writeln!(writer, "# x pix: {}, y pix: {}, x mic: {}, y mic: {}", g.x_pix, g.y_pix, g.x_mic, g.y_mic)?;
            writeln!(writer, "# {}: {}", mode, key)?;
            // one line per grid row
            for row in column.chunks(width) {
                let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                writeln!(writer, "{}", line.join("\t"))?;
            }
            writer.flush()?;
            written.push(path);
        }
    }
    Ok(written)
}

/// Reads back the values of a property file, in pixel order.
pub fn read_property_file<P: AsRef<Path>>(filepath: P) -> SspfmResult<Vec<f64>> {
    let path = filepath.as_ref();
    let content = fs::read_to_string(path)?;
    let mut values = Vec::new();
    for line in content.lines().filter(|l| !l.starts_with('#') && !l.trim().is_empty()) {
        for field in line.split('\t').filter(|f| !f.is_empty()) {
            values.push(
                field
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| SspfmError::Parse(format!("{}: '{}': {}", path.display(), field, e)))?,
            );
        }
    }
    Ok(values)
}

pub const BEST_LOOP_TITLES: [&str; 5] = ["index", "write volt [V]", "piezoresponse [a.u]", "piezoresponse std", "fit [a.u]"];

/// Selected loop of one pixel, with the fitted curve when available.
pub fn write_best_loop<P: AsRef<Path>>(
    filepath: P,
    best: &BestLoop,
    fit: Option<&HysteresisFit>,
) -> SspfmResult<()> {
    let mut writer = BufWriter::new(File::create(filepath)?);
    writeln!(writer, "# Date of analysis: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(writer, "# Analysis mode: {}", best.mode)?;
    writeln!(writer, "# Read volt [V]: {}", best.read_volt)?;
    let table: Vec<String> = best.bckgnd_tab.iter().map(|(v, bg)| format!("{}: {}", v, bg)).collect();
    writeln!(writer, "# Background: {}", table.join(", "))?;
    writeln!(writer, "# {}", BEST_LOOP_TITLES.join(DELIMITER))?;

    let nanoloop = &best.nanoloop;
    let n = nanoloop.write_volt.len();
    for i in 0..n {
        let x = nanoloop.write_volt[i];
        let std = nanoloop.piezorep_std.as_ref().map_or(f64::NAN, |s| s[i]);
        // last point closes the right branch
        let rising = i + 1 == n || nanoloop.write_volt[i + 1] >= x;
        let side = if rising { Side::Right } else { Side::Left };
        let y_fit = fit.map_or(f64::NAN, |f| f.eval(side, x));
        writeln!(writer, "{}\t\t{}\t\t{}\t\t{}\t\t{}", i, x, nanoloop.piezorep[i], std, y_fit)?;
    }
    writer.flush()?;
    Ok(())
}

/// Best-loop file content: header fields and the numeric rows.
#[derive(Debug, Clone, PartialEq)]
pub struct BestLoopRecord {
    pub mode: String,
    pub read_volt: f64,
    pub rows: Vec<[f64; 5]>,
}

pub fn read_best_loop<P: AsRef<Path>>(filepath: P) -> SspfmResult<BestLoopRecord> {
    let path = filepath.as_ref();
    let content = fs::read_to_string(path)?;
    let mut record = BestLoopRecord { mode: String::new(), read_volt: f64::NAN, rows: Vec::new() };
    for line in content.lines() {
        if let Some(header) = line.strip_prefix('#') {
            let header = header.trim();
            if let Some(mode) = header.strip_prefix("Analysis mode:") {
                record.mode = mode.trim().to_string();
            } else if let Some(v) = header.strip_prefix("Read volt [V]:") {
                record.read_volt = v.trim().parse()?;
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<f64> = line
            .split(DELIMITER)
            .map(|f| f.trim().parse::<f64>())
            .collect::<Result<_, _>>()?;
        let row: [f64; 5] = fields.as_slice().try_into().map_err(|_| {
            SspfmError::Parse(format!("{}: expected {} columns, found {}", path.display(), 5, fields.len()))
        })?;
        record.rows.push(row);
    }
    Ok(record)
}

/// `parameters.txt`: dated sections of `key: value` lines.
pub fn write_parameters<P: AsRef<Path>>(
    filepath: P,
    start: chrono::DateTime<chrono::Local>,
    end: chrono::DateTime<chrono::Local>,
    sections: &[(&str, Vec<(String, String)>)],
) -> SspfmResult<()> {
    let mut writer = BufWriter::new(File::create(filepath)?);
    writeln!(writer, "Date of analysis: {}", start.format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(writer, "End of analysis: {}", end.format("%Y-%m-%d %H:%M:%S"))?;
    let duration = end.signed_duration_since(start);
    writeln!(writer, "Duration: {:.3} s", duration.num_milliseconds() as f64 / 1000.0)?;
    for (title, entries) in sections {
        writeln!(writer)?;
        writeln!(writer, "--- {} ---", title)?;
        for (key, value) in entries {
            writeln!(writer, "{}: {}", key, value)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Flattens a serialisable record into `key: value` entries for `write_parameters`.
pub fn record_entries<T: serde::Serialize>(record: &T) -> SspfmResult<Vec<(String, String)>> {
    let value = serde_json::to_value(record)?;
    let mut out = Vec::new();
    flatten_json("", &value, &mut out);
    Ok(out)
}

fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) };
                flatten_json(&key, v, out);
            }
        }
        serde_json::Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sspfm_hysteresis::tests::{generator, synthetic_rows};
    use crate::sspfm_nanoloop::Nanoloop;
    use crate::sspfm_phase::{PhaseCalibration, PiezoFunc};
    use crate::sspfm_select::AnalysisMode;
    use crate::sspfm_signal::SignalParams;
    use tempfile::tempdir;

    #[test]
    fn test_property_map_files() {
        let dir = tempdir().unwrap();
        let grid = Grid { x_pix: 3, y_pix: 2, x_mic: 1.5, y_mic: 1.0 };
        let mut map = PropertyMap::new(grid);
        map.insert(0, "off", "charac tot fit: imprint", 0.25);
        map.insert(4, "off", "charac tot fit: imprint", -0.5);
        map.extend(1, "on", vec![("fit pars: slope".to_string(), 2.0)]);

        let files = write_property_files(&dir.path().join("properties"), &map).unwrap();
        assert_eq!(files.len(), 2);
        let path = dir.path().join("properties").join("off_charac_tot_fit_imprint.txt");
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# x pix: 3, y pix: 2, x mic: 1.5, y mic: 1"));
        let values = read_property_file(&path).unwrap();
        assert_eq!(values.len(), 6);
        assert_eq!(values[0], 0.25);
        assert_eq!(values[4], -0.5);
        assert!(values[1].is_nan());
    }

    #[test]
    fn test_merge_keeps_pixels() {
        let grid = Grid { x_pix: 2, y_pix: 1, x_mic: 1.0, y_mic: 1.0 };
        let mut a = PropertyMap::new(grid);
        a.insert(0, "off", "area", 1.0);
        let mut b = PropertyMap::new(grid);
        b.insert(1, "off", "area", 2.0);
        a.merge(b);
        assert_eq!(a.get("off", "area").unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_best_loop_file() {
        let dir = tempdir().unwrap();
        let fit = generator(1.0, 3.0, -2.0, 2.0, 0.0, 0.0);
        let nanoloop = Nanoloop::from_rows(&synthetic_rows(&fit, 11, 5.0, 0.5), &PhaseCalibration::raw(PiezoFunc::Cos));
        let best = BestLoop {
            mode: AnalysisMode::MultiLoop,
            read_volt: 0.5,
            bckgnd_tab: vec![(0.0, 0.1), (0.5, 0.02)],
            fit: Some(fit),
            nanoloop,
        };
        let path = dir.path().join("pixel_0_off_f.txt");
        write_best_loop(&path, &best, best.fit.as_ref()).unwrap();
        let record = read_best_loop(&path).unwrap();
        assert_eq!(record.mode, "multi_loop");
        assert_eq!(record.read_volt, 0.5);
        assert_eq!(record.rows.len(), 20);
        for row in &record.rows {
            assert!((row[2] - row[4]).abs() < 1e-12);
            assert!(row[3].is_nan());
        }
    }

    #[test]
    fn test_parameters_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        let start = chrono::Local::now();
        let end = start + chrono::Duration::milliseconds(1500);
        let signal = record_entries(&SignalParams::default()).unwrap();
        write_parameters(&path, start, end, &[("Signal parameters", signal)]).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("Duration: 1.500 s"));
        assert!(content.contains("--- Signal parameters ---"));
        assert!(content.contains("mode_w: Zero up"));
        assert!(content.contains("n_w: 26"));
    }
}
