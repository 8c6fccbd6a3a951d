use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::sspfm_cut::FieldMode;
use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_phase::PhaseCalibration;
use crate::sspfm_segment::Segment;
use crate::sspfm_signal::{cycle_length, WriteMode};
use crate::sspfm_utils::{mean, min_max, nan_mean, nan_std};

pub const COLUMN_TITLES: [&str; 10] = [
    "index",
    "read volt [V]",
    "write volt [V]",
    "amplitude [a.u]",
    "phase [°]",
    "res freq [kHz]",
    "q fact []",
    "amplitude std",
    "phase std",
    "res freq std",
];

const DELIMITER: &str = "\t\t";

/// One row of a nanoloop table, i.e. one reduced segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopRow {
    pub index: usize,
    pub read_volt: f64,
    pub write_volt: f64,
    pub amp: f64,
    pub pha: f64,
    pub res_freq: f64,
    pub q_fact: f64,
    pub amp_std: f64,
    pub pha_std: f64,
    pub res_freq_std: f64,
}

impl From<&Segment> for LoopRow {
    fn from(seg: &Segment) -> Self {
        LoopRow {
            index: seg.index,
            read_volt: seg.read_voltage,
            write_volt: seg.write_voltage,
            amp: seg.amp,
            pha: seg.pha,
            res_freq: seg.res_freq,
            q_fact: seg.q_fact,
            amp_std: seg.amp_std,
            pha_std: seg.pha_std,
            res_freq_std: seg.res_freq_std,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NanoloopTable {
    pub analysis_date: String,
    pub other_properties: BTreeMap<String, f64>,
    pub rows: Vec<LoopRow>,
}

impl NanoloopTable {
    pub fn new(rows: Vec<LoopRow>, other_properties: BTreeMap<String, f64>) -> Self {
        NanoloopTable {
            analysis_date: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            other_properties,
            rows,
        }
    }

    pub fn phases(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.pha).collect()
    }

    pub fn write_voltages(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.write_volt).collect()
    }
}

pub fn nanoloop_file_name(stem: &str, field: FieldMode) -> String {
    format!("{}_{}.txt", stem, field.as_str())
}

/// Splits `<stem>_<on_f|off_f>.txt` back into its pixel stem and field mode.
pub fn parse_file_name(name: &str) -> Option<(String, FieldMode)> {
    let base = name.strip_suffix(".txt")?;
    FieldMode::both().into_iter().find_map(|field| {
        base.strip_suffix(&format!("_{}", field.as_str()))
            .map(|stem| (stem.to_string(), field))
    })
}

pub fn write_nanoloop_file<P: AsRef<Path>>(filepath: P, table: &NanoloopTable) -> SspfmResult<()> {
    let file = File::create(filepath)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# Date of analysis: {}", table.analysis_date)?;
    if !table.other_properties.is_empty() {
        let props: Vec<String> = table
            .other_properties
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        writeln!(writer, "# Segment other properties: {}", props.join(", "))?;
    }
    writeln!(writer, "# {}", COLUMN_TITLES.join(DELIMITER))?;
    for r in &table.rows {
        writeln!(
            writer,
            "{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}\t\t{}",
            r.index, r.read_volt, r.write_volt, r.amp, r.pha, r.res_freq, r.q_fact, r.amp_std, r.pha_std, r.res_freq_std
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_nanoloop_file<P: AsRef<Path>>(filepath: P) -> SspfmResult<NanoloopTable> {
    let path = filepath.as_ref();
    let content = fs::read_to_string(path)?;
    let mut table = NanoloopTable { analysis_date: String::new(), other_properties: BTreeMap::new(), rows: Vec::new() };

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            let header = header.trim();
            if let Some(date) = header.strip_prefix("Date of analysis:") {
                table.analysis_date = date.trim().to_string();
            } else if let Some(props) = header.strip_prefix("Segment other properties:") {
                for item in props.split(',') {
                    if let Some((key, value)) = item.split_once(':') {
                        table.other_properties.insert(key.trim().to_string(), value.trim().parse::<f64>()?);
                    }
                }
            }
            continue;
        }
        let fields: Vec<&str> = line.split(DELIMITER).map(str::trim).collect();
        if fields.len() != COLUMN_TITLES.len() {
            return Err(SspfmError::Parse(format!(
                "{}:{}: expected {} columns, found {}",
                path.display(),
                line_no + 1,
                COLUMN_TITLES.len(),
                fields.len()
            )));
        }
        let v: Vec<f64> = fields[1..]
            .iter()
            .map(|f| f.parse::<f64>())
            .collect::<Result<_, _>>()?;
        table.rows.push(LoopRow {
            index: fields[0].parse()?,
            read_volt: v[0],
            write_volt: v[1],
            amp: v[2],
            pha: v[3],
            res_freq: v[4],
            q_fact: v[5],
            amp_std: v[6],
            pha_std: v[7],
            res_freq_std: v[8],
        });
    }
    Ok(table)
}

/// Piezoresponse against write voltage, sorted along the branch direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Branch {
    pub write_volt: Vec<f64>,
    pub piezorep: Vec<f64>,
}

impl Branch {
    fn push(&mut self, x: f64, y: f64) {
        self.write_volt.push(x);
        self.piezorep.push(y);
    }

    fn sort(&mut self, ascending: bool) {
        let mut pairs: Vec<(f64, f64)> = self.write_volt.iter().cloned().zip(self.piezorep.iter().cloned()).collect();
        pairs.sort_by(|a, b| if ascending { a.0.total_cmp(&b.0) } else { b.0.total_cmp(&a.0) });
        let (x, y) = pairs.into_iter().unzip();
        self.write_volt = x;
        self.piezorep = y;
    }

    pub fn len(&self) -> usize {
        self.write_volt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.write_volt.is_empty()
    }
}

/// Piezoresponse loop at one read voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct Nanoloop {
    pub read_volt: f64,
    pub write_volt: Vec<f64>,
    pub amp: Vec<f64>,
    pub pha: Vec<f64>,
    pub res_freq: Vec<f64>,
    pub q_fact: Vec<f64>,
    pub piezorep: Vec<f64>,
    /// Pointwise spread, only for averaged loops.
    pub piezorep_std: Option<Vec<f64>>,
    pub write_mode: WriteMode,
    pub left: Branch,
    pub right: Branch,
}

impl Nanoloop {
    pub fn from_rows(rows: &[LoopRow], calibration: &PhaseCalibration) -> Self {
        let write_volt: Vec<f64> = rows.iter().map(|r| r.write_volt).collect();
        let pha: Vec<f64> = rows.iter().map(|r| calibration.correct(r.pha)).collect();
        let amp: Vec<f64> = rows.iter().map(|r| r.amp).collect();
        let piezorep = amp.iter().zip(&pha).map(|(&a, &p)| calibration.func.apply(a, p)).collect();
        let read_volt = mean(&rows.iter().map(|r| r.read_volt).collect::<Vec<_>>());
        Nanoloop::assemble(
            read_volt,
            write_volt,
            amp,
            pha,
            rows.iter().map(|r| r.res_freq).collect(),
            rows.iter().map(|r| r.q_fact).collect(),
            piezorep,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        read_volt: f64,
        write_volt: Vec<f64>,
        amp: Vec<f64>,
        pha: Vec<f64>,
        res_freq: Vec<f64>,
        q_fact: Vec<f64>,
        piezorep: Vec<f64>,
        piezorep_std: Option<Vec<f64>>,
    ) -> Self {
        let write_mode = detect_write_mode(&write_volt);
        let (left, right) = split_branches(&write_volt, &piezorep);
        Nanoloop { read_volt, write_volt, amp, pha, res_freq, q_fact, piezorep, piezorep_std, write_mode, left, right }
    }

    pub fn bias_range(&self) -> (f64, f64) {
        min_max(&self.write_volt)
    }
}

/// Write mode from the first three voltages of a cycle.
pub fn detect_write_mode(write_volt: &[f64]) -> WriteMode {
    let (min, max) = min_max(write_volt);
    match write_volt {
        [v0, ..] if *v0 == min => WriteMode::LowUp,
        [v0, ..] if *v0 == max => WriteMode::HighDown,
        [v0, v1, v2, ..] if (v1 - v0) + (v2 - v1) < 0.0 => WriteMode::ZeroDown,
        [v0, v1] if v1 < v0 => WriteMode::ZeroDown,
        _ => WriteMode::ZeroUp,
    }
}

/// Splits a loop into its decreasing (left) and increasing (right) branches
/// and closes each with the global extrema it misses.
pub fn split_branches(write_volt: &[f64], piezorep: &[f64]) -> (Branch, Branch) {
    let n = write_volt.len();
    let mut left = Branch::default();
    let mut right = Branch::default();
    if n == 0 {
        return (left, right);
    }
    for i in 0..n {
        let delta = if i + 1 < n {
            write_volt[i + 1] - write_volt[i]
        } else if n > 1 {
            write_volt[i] - write_volt[i - 1]
        } else {
            1.0
        };
        if delta >= 0.0 {
            right.push(write_volt[i], piezorep[i]);
        } else {
            left.push(write_volt[i], piezorep[i]);
        }
    }

    let (min, max) = min_max(write_volt);
    let sample_at = |target: f64| -> f64 {
        write_volt
            .iter()
            .position(|&v| v == target)
            .map(|i| piezorep[i])
            .unwrap_or(f64::NAN)
    };
    for branch in [&mut left, &mut right] {
        for extremum in [min, max] {
            if !branch.write_volt.contains(&extremum) {
                branch.push(extremum, sample_at(extremum));
            }
        }
    }
    left.sort(false);
    right.sort(true);
    (left, right)
}

/// Splits the table rows into successive cycles, one per read voltage.
pub fn group_loops(rows: &[LoopRow]) -> SspfmResult<Vec<Vec<LoopRow>>> {
    if rows.is_empty() {
        return Err(SspfmError::Logic("Nanoloop table holds no rows".to_string()));
    }
    let writes: Vec<f64> = rows.iter().map(|r| r.write_volt).collect();
    let per_cycle = cycle_length(&writes);
    if per_cycle == 0 || rows.len() % per_cycle != 0 {
        return Err(SspfmError::Logic(format!(
            "{} rows do not split into cycles of {}",
            rows.len(),
            per_cycle
        )));
    }
    Ok(rows.chunks(per_cycle).map(|c| c.to_vec()).collect())
}

/// Whether every loop shares the write voltage grid of the first one.
pub fn shares_grid(loops: &[Nanoloop]) -> bool {
    let Some(first) = loops.first() else {
        return true;
    };
    loops.iter().all(|l| {
        l.write_volt.len() == first.write_volt.len()
            && l.write_volt.iter().zip(&first.write_volt).all(|(a, b)| (a - b).abs() <= 1e-9 * b.abs().max(1.0))
    })
}

pub fn build_loops(table: &NanoloopTable, calibration: &PhaseCalibration) -> SspfmResult<Vec<Nanoloop>> {
    Ok(group_loops(&table.rows)?
        .iter()
        .map(|rows| Nanoloop::from_rows(rows, calibration))
        .collect())
}

/// Pointwise mean of loops sharing one write-voltage grid, optionally
/// dropping the first (pristine) loop.
pub fn mean_loop(loops: &[Nanoloop], del_1st_loop: bool) -> SspfmResult<Nanoloop> {
    let used: &[Nanoloop] = if del_1st_loop && loops.len() > 1 { &loops[1..] } else { loops };
    let first = used
        .first()
        .ok_or_else(|| SspfmError::Logic("No loop to average".to_string()))?;
    let n = first.write_volt.len();
    if !shares_grid(used) {
        return Err(SspfmError::Logic("Loops do not share a write voltage grid".to_string()));
    }

    let piezorep = pointwise(used, n, |l| &l.piezorep, nan_mean);
    let piezorep_std = if used.len() > 1 { pointwise(used, n, |l| &l.piezorep, nan_std) } else { vec![0.0; n] };
    let read_volts: Vec<f64> = used.iter().map(|l| l.read_volt).collect();

    Ok(Nanoloop::assemble(
        nan_mean(&read_volts),
        first.write_volt.clone(),
        pointwise(used, n, |l| &l.amp, nan_mean),
        pointwise(used, n, |l| &l.pha, nan_mean),
        pointwise(used, n, |l| &l.res_freq, nan_mean),
        pointwise(used, n, |l| &l.q_fact, nan_mean),
        piezorep,
        Some(piezorep_std),
    ))
}

fn pointwise<F>(loops: &[Nanoloop], n: usize, get: F, reduce: fn(&[f64]) -> f64) -> Vec<f64>
where
    F: Fn(&Nanoloop) -> &Vec<f64>,
{
    (0..n)
        .map(|i| reduce(&loops.iter().map(|l| get(l)[i]).collect::<Vec<_>>()))
        .collect()
}
