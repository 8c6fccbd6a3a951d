use crate::sspfm_error::{SspfmError, SspfmResult};
use crate::sspfm_segment::ReductionMode;
use crate::sspfm_signal::{ReadMode, SignalParams};

closed_enum! {
    /// Whether a segment is measured while the write bias is applied.
    FieldMode, "field mode" {
        On => "on_f",
        Off => "off_f",
    }
}

impl FieldMode {
    pub fn both() -> [FieldMode; 2] {
        [FieldMode::On, FieldMode::Off]
    }

    pub fn label(&self) -> &'static str {
        match self {
            FieldMode::On => "on field",
            FieldMode::Off => "off field",
        }
    }
}

/// Start indices of every on-field (write) and off-field (read) window.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCut {
    pub on_field: Vec<usize>,
    pub off_field: Vec<usize>,
    pub total_segments: usize,
}

/// One window of the raw time series aligned with the bias schedule.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub start_index: usize,
    pub end_index: usize,
    pub times: Vec<f64>,
    pub write_voltage: f64,
    pub read_voltage: f64,
    pub field: FieldMode,
    pub mode: ReductionMode,
    pub index: usize,
}

/// Emits the window start indices. A flat read range forces the single read step mode.
pub fn cut(params: &mut SignalParams) -> SegmentCut {
    if params.min_r == params.max_r {
        params.mode_r = ReadMode::SingleReadStep;
    }
    let total_segments = params.total_pairs();
    let stride = params.pair_samples();

    let on_field: Vec<usize> = (0..total_segments)
        .map(|k| params.hold_samples_start + k * stride)
        .collect();
    let off_field = on_field.iter().map(|&start| start + params.seg_samples_w).collect();

    SegmentCut {
        on_field,
        off_field,
        total_segments,
    }
}

impl SegmentCut {
    /// Fails when the last window runs past the recorded samples.
    pub fn check_fits(&self, params: &SignalParams, n_samples: usize) -> SspfmResult<()> {
        if let Some(&last) = self.off_field.last() {
            let end = last + params.seg_samples_r;
            if end > n_samples {
                return Err(SspfmError::Ingest(format!(
                    "Bias schedule needs {} samples but the measurement holds {}",
                    end, n_samples
                )));
            }
        }
        Ok(())
    }

    /// Builds one `SegmentInfo` per window of the requested field mode.
    pub fn segment_infos(
        &self,
        params: &SignalParams,
        schedule: &[f64],
        times: &[f64],
        field: FieldMode,
        mode: ReductionMode,
    ) -> SspfmResult<Vec<SegmentInfo>> {
        self.check_fits(params, times.len())?;
        if schedule.len() < 2 * self.total_segments {
            return Err(SspfmError::Logic(format!(
                "Schedule holds {} pairs, cut expects {}",
                schedule.len() / 2,
                self.total_segments
            )));
        }
        let (starts, width) = match field {
            FieldMode::On => (&self.on_field, params.seg_samples_w),
            FieldMode::Off => (&self.off_field, params.seg_samples_r),
        };
        Ok(starts
            .iter()
            .enumerate()
            .map(|(index, &start)| SegmentInfo {
                start_index: start,
                end_index: start + width,
                times: times[start..start + width].to_vec(),
                // the schedule interleaves write and read voltages
                write_voltage: schedule[2 * index],
                read_voltage: schedule[2 * index + 1],
                field,
                mode,
                index,
            })
            .collect())
    }
}
