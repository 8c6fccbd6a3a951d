use serde::{Deserialize, Serialize};

use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_utils::min_max;

closed_enum! {
    /// Shape of the write-voltage ramp over one cycle.
    WriteMode, "mode_w" {
        ZeroUp => "Zero up",
        ZeroDown => "Zero down",
        LowUp => "Low up",
        HighDown => "High down",
    }
}

closed_enum! {
    /// Ordering of the read voltages across cycles.
    ReadMode, "mode_r" {
        SingleReadStep => "Single Read Step",
        LowToHigh => "Low to High",
        HighToLow => "High to Low",
    }
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::ZeroUp
    }
}

impl Default for ReadMode {
    fn default() -> Self {
        ReadMode::SingleReadStep
    }
}

/// Bias waveform description: write/read ramps and their sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalParams {
    pub min_w: f64,
    pub max_w: f64,
    pub n_w: usize,
    pub mode_w: WriteMode,
    pub seg_samples_w: usize,
    pub seg_duration_w_ms: f64,
    pub min_r: f64,
    pub max_r: f64,
    pub n_r: usize,
    pub mode_r: ReadMode,
    pub seg_samples_r: usize,
    pub seg_duration_r_ms: f64,
    pub hold_samples_start: usize,
    pub hold_samples_end: usize,
    pub hold_duration_start_ms: f64,
    pub hold_duration_end_ms: f64,
    /// Write extrema grow linearly with the cycle index.
    pub open_mode: bool,
    /// Voltage at which "Zero up"/"Zero down" cycles start.
    pub threshold: f64,
}

impl Default for SignalParams {
    fn default() -> Self {
        SignalParams {
            min_w: -10.0,
            max_w: 10.0,
            n_w: 26,
            mode_w: WriteMode::ZeroUp,
            seg_samples_w: 10,
            seg_duration_w_ms: 5.0,
            min_r: 0.0,
            max_r: 0.0,
            n_r: 1,
            mode_r: ReadMode::SingleReadStep,
            seg_samples_r: 10,
            seg_duration_r_ms: 5.0,
            hold_samples_start: 0,
            hold_samples_end: 0,
            hold_duration_start_ms: 0.0,
            hold_duration_end_ms: 0.0,
            open_mode: false,
            threshold: 0.0,
        }
    }
}

impl SignalParams {
    pub fn pairs_per_cycle(&self) -> usize {
        2 * self.n_w.saturating_sub(1)
    }

    pub fn total_pairs(&self) -> usize {
        self.pairs_per_cycle() * self.n_r
    }

    pub fn pair_samples(&self) -> usize {
        self.seg_samples_w + self.seg_samples_r
    }

    /// Number of samples the dense waveform spans, holds included.
    pub fn total_samples(&self) -> usize {
        self.hold_samples_start + self.total_pairs() * self.pair_samples() + self.hold_samples_end
    }

    pub fn validate(&self) -> SspfmResult<()> {
        if self.n_w < 2 {
            return Err(SspfmError::config("n_w", &self.n_w.to_string(), &[">= 2"]));
        }
        if self.n_r < 1 {
            return Err(SspfmError::config("n_r", &self.n_r.to_string(), &[">= 1"]));
        }
        if !(self.max_w > self.min_w) {
            return Err(SspfmError::Logic(format!(
                "Write voltage range is empty: min {} >= max {}",
                self.min_w, self.max_w
            )));
        }
        if self.max_r < self.min_r {
            return Err(SspfmError::Logic(format!(
                "Read voltage range is reversed: min {} > max {}",
                self.min_r, self.max_r
            )));
        }
        Ok(())
    }

    pub fn read_values(&self) -> Vec<f64> {
        match self.mode_r {
            ReadMode::SingleReadStep => vec![self.min_r; self.n_r],
            ReadMode::LowToHigh => linspace(self.min_r, self.max_r, self.n_r),
            ReadMode::HighToLow => linspace(self.max_r, self.min_r, self.n_r),
        }
    }
}

pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Write voltages of a single cycle: `2 * (n - 1)` values.
pub fn write_cycle(min: f64, max: f64, n: usize, mode: WriteMode, threshold: f64) -> Vec<f64> {
    if n < 2 {
        return vec![min; n];
    }
    let up = linspace(min, max, n);
    let interior: Vec<f64> = up[1..n - 1].to_vec();

    let mut low_up = up.clone();
    low_up.extend(interior.iter().rev());

    let mut high_down: Vec<f64> = up.iter().rev().cloned().collect();
    high_down.extend(interior.iter());

    match mode {
        WriteMode::LowUp => low_up,
        WriteMode::HighDown => high_down,
        WriteMode::ZeroUp => {
            // first rising value at or above the threshold
            let start = (0..n).find(|&i| low_up[i] >= threshold).unwrap_or(0);
            rotate(&low_up, start)
        }
        WriteMode::ZeroDown => {
            let start = (0..n).find(|&i| high_down[i] <= threshold).unwrap_or(0);
            rotate(&high_down, start)
        }
    }
}

fn rotate(values: &[f64], start: usize) -> Vec<f64> {
    values[start..].iter().chain(values[..start].iter()).cloned().collect()
}

/// Sparse schedule: each write voltage followed by the read voltage of its cycle.
pub fn generate(params: &SignalParams) -> SspfmResult<Vec<f64>> {
    params.validate()?;
    let reads = params.read_values();
    let mut schedule = Vec::with_capacity(2 * params.total_pairs());

    for (cycle, &read) in reads.iter().enumerate() {
        let (min_w, max_w) = if params.open_mode {
            let scale = (cycle + 1) as f64 / params.n_r as f64;
            (params.min_w * scale, params.max_w * scale)
        } else {
            (params.min_w, params.max_w)
        };
        for write in write_cycle(min_w, max_w, params.n_w, params.mode_w, params.threshold) {
            schedule.push(write);
            schedule.push(read);
        }
    }
    Ok(schedule)
}

/// Densifies a sparse schedule into per-sample times (s) and voltages.
///
/// Holds sit at 0 V. The start hold is only emitted when `start_hold` is set.
pub fn expand_time(schedule: &[f64], params: &SignalParams, start_hold: bool) -> (Vec<f64>, Vec<f64>) {
    let mut times = Vec::with_capacity(params.total_samples());
    let mut voltages = Vec::with_capacity(params.total_samples());
    let mut t0 = 0.0;

    let mut push_segment = |value: f64, samples: usize, duration_ms: f64, t0: &mut f64| {
        if samples == 0 {
            return;
        }
        let dt = duration_ms / 1000.0 / samples as f64;
        for i in 0..samples {
            times.push(*t0 + dt * i as f64);
            voltages.push(value);
        }
        *t0 += duration_ms / 1000.0;
    };

    if start_hold {
        push_segment(0.0, params.hold_samples_start, params.hold_duration_start_ms, &mut t0);
    }
    for (i, &value) in schedule.iter().enumerate() {
        if i % 2 == 0 {
            push_segment(value, params.seg_samples_w, params.seg_duration_w_ms, &mut t0);
        } else {
            push_segment(value, params.seg_samples_r, params.seg_duration_r_ms, &mut t0);
        }
    }
    push_segment(0.0, params.hold_samples_end, params.hold_duration_end_ms, &mut t0);

    (times, voltages)
}

fn approx_eq(a: f64, b: f64, scale: f64) -> bool {
    (a - b).abs() <= 1e-9 * scale.max(1.0)
}

/// Number of write values per cycle, read off the turning points of the
/// write ramp. Holds for open mode too, where the extrema move from cycle to
/// cycle but their positions do not. The whole sequence when fewer than two
/// turning points exist.
pub fn cycle_length(writes: &[f64]) -> usize {
    let turns: Vec<usize> = (1..writes.len().saturating_sub(1))
        .filter(|&i| {
            let (prev, cur, next) = (writes[i - 1], writes[i], writes[i + 1]);
            (cur > prev && cur > next) || (cur < prev && cur < next)
        })
        .collect();
    match turns.as_slice() {
        [first, second, ..] => 2 * (second - first),
        _ => writes.len(),
    }
}

/// Recovers the signal parameters from a sparse write/read schedule.
///
/// Timing fields are left at their defaults since a sparse schedule does not
/// carry them.
pub fn extract_params(schedule: &[f64]) -> SspfmResult<SignalParams> {
    if schedule.len() < 4 || schedule.len() % 2 != 0 {
        return Err(SspfmError::Logic(format!(
            "Bias schedule must hold an even number (>= 4) of values, got {}",
            schedule.len()
        )));
    }
    let writes: Vec<f64> = schedule.iter().step_by(2).cloned().collect();
    let reads: Vec<f64> = schedule.iter().skip(1).step_by(2).cloned().collect();

    let per_cycle = cycle_length(&writes);
    if per_cycle < 2 || per_cycle % 2 != 0 || writes.len() % per_cycle != 0 {
        return Err(SspfmError::Logic(format!(
            "{} writes do not split into cycles of {}",
            writes.len(),
            per_cycle
        )));
    }
    let n_cycles = writes.len() / per_cycle;
    let n_w = per_cycle / 2 + 1;

    // the last cycle spans the full write range, open mode or not
    let (min_w, max_w) = min_max(&writes[writes.len() - per_cycle..]);
    let (first_min, first_max) = min_max(&writes[..per_cycle]);
    let scale = max_w.abs().max(min_w.abs());
    let open_mode = n_cycles > 1 && !approx_eq(first_max - first_min, max_w - min_w, scale);

    let (w0, w1) = (writes[0], writes[1]);
    let (mode_w, threshold) = if approx_eq(w0, first_min, scale) {
        (WriteMode::LowUp, 0.0)
    } else if approx_eq(w0, first_max, scale) {
        (WriteMode::HighDown, 0.0)
    } else if w1 > w0 {
        (WriteMode::ZeroUp, w0)
    } else {
        (WriteMode::ZeroDown, w0)
    };

    let cycle_reads: Vec<f64> = (0..n_cycles).map(|c| reads[c * per_cycle]).collect();
    let first = cycle_reads[0];
    let last = cycle_reads[n_cycles - 1];
    let read_scale = first.abs().max(last.abs());
    let (mode_r, min_r, max_r) = if cycle_reads.iter().all(|&r| approx_eq(r, first, read_scale)) {
        (ReadMode::SingleReadStep, first, first)
    } else if last > first {
        (ReadMode::LowToHigh, first, last)
    } else {
        (ReadMode::HighToLow, last, first)
    };

    let params = SignalParams {
        min_w,
        max_w,
        n_w,
        mode_w,
        min_r,
        max_r,
        n_r: n_cycles,
        mode_r,
        open_mode,
        threshold,
        ..SignalParams::default()
    };
    let rebuilt = generate(&params)?;
    let scale = scale.max(read_scale);
    if rebuilt.len() != schedule.len() || rebuilt.iter().zip(schedule).any(|(a, b)| !approx_eq(*a, *b, scale)) {
        return Err(SspfmError::Logic("Bias schedule does not follow a regular SSPFM waveform".to_string()));
    }
    Ok(params)
}
