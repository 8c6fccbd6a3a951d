//! Per-pixel work dispatch shared by both stages.

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sspfm_error::{SspfmError, SspfmResult};

/// Result of one pixel job.
#[derive(Debug)]
pub enum PixelOutcome<T> {
    Done(T),
    /// Pixel left out of the aggregate; the run goes on.
    Skipped(String),
    /// Stops the remaining jobs.
    Fatal(SspfmError),
}

/// Aggregate of a dispatch, ordered by pixel index.
#[derive(Debug)]
pub struct Dispatch<T> {
    pub done: Vec<(usize, T)>,
    pub skipped: Vec<(usize, String)>,
    /// First fatal error; the aggregate is partial when set.
    pub fatal: Option<SspfmError>,
}

impl<T> Dispatch<T> {
    fn collect<I: IntoIterator<Item = (usize, PixelOutcome<T>)>>(outcomes: I) -> Self {
        let mut dispatch = Dispatch { done: Vec::new(), skipped: Vec::new(), fatal: None };
        for (index, outcome) in outcomes {
            match outcome {
                PixelOutcome::Done(value) => dispatch.done.push((index, value)),
                PixelOutcome::Skipped(reason) => dispatch.skipped.push((index, reason)),
                PixelOutcome::Fatal(error) => {
                    if dispatch.fatal.is_none() {
                        dispatch.fatal = Some(error);
                    }
                }
            }
        }
        dispatch.done.sort_by_key(|(index, _)| *index);
        dispatch.skipped.sort_by_key(|(index, _)| *index);
        dispatch
    }
}

/// Runs `job` for pixels `0..n_pixels`, on a rayon pool of `workers` threads
/// (0 for one per core) when `parallel` is set. A fatal outcome keeps the
/// pending jobs from starting.
pub fn dispatch<T, F>(n_pixels: usize, parallel: bool, workers: usize, job: F) -> SspfmResult<Dispatch<T>>
where
    T: Send,
    F: Fn(usize) -> PixelOutcome<T> + Sync,
{
    if !parallel {
        let mut outcomes = Vec::with_capacity(n_pixels);
        for index in 0..n_pixels {
            let outcome = job(index);
            let fatal = matches!(outcome, PixelOutcome::Fatal(_));
            outcomes.push((index, outcome));
            if fatal {
                break;
            }
        }
        return Ok(Dispatch::collect(outcomes));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| SspfmError::Logic(format!("Worker pool could not start: {}", e)))?;
    let abort = AtomicBool::new(false);

    let outcomes: Vec<Option<(usize, PixelOutcome<T>)>> = pool.install(|| {
        (0..n_pixels)
            .into_par_iter()
            .map(|index| {
                if abort.load(Ordering::SeqCst) {
                    return None;
                }
                let outcome = job(index);
                if matches!(outcome, PixelOutcome::Fatal(_)) {
                    abort.store(true, Ordering::SeqCst);
                }
                Some((index, outcome))
            })
            .collect()
    });
    Ok(Dispatch::collect(outcomes.into_iter().flatten()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(index: usize) -> PixelOutcome<usize> {
        match index {
            3 => PixelOutcome::Skipped("unreadable".to_string()),
            _ => PixelOutcome::Done(index * 10),
        }
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let seq = dispatch(8, false, 0, job).unwrap();
        let par = dispatch(8, true, 3, job).unwrap();
        assert_eq!(seq.done, par.done);
        assert_eq!(seq.done.len(), 7);
        assert_eq!(seq.done[3], (4, 40));
        assert_eq!(par.skipped, vec![(3, "unreadable".to_string())]);
        assert!(par.fatal.is_none());
    }

    #[test]
    fn test_fatal_stops_sequential_run() {
        let run = dispatch(6, false, 0, |index| {
            if index == 2 {
                PixelOutcome::Fatal(SspfmError::Logic("disk full".to_string()))
            } else {
                PixelOutcome::Done(index)
            }
        })
        .unwrap();
        assert_eq!(run.done, vec![(0, 0), (1, 1)]);
        assert!(matches!(run.fatal, Some(SspfmError::Logic(_))));
    }

    #[test]
    fn test_fatal_returns_partial_parallel_aggregate() {
        let run = dispatch(64, true, 2, |index| {
            if index == 0 {
                PixelOutcome::Fatal(SspfmError::Logic("disk full".to_string()))
            } else {
                PixelOutcome::Done(index)
            }
        })
        .unwrap();
        assert!(run.fatal.is_some());
        assert!(run.done.len() < 64);
        assert!(run.done.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
