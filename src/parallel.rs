//! Parallel oracle evaluation
//!
//! Sigma points and particles are scored independently, so each phase fans the
//! work out over scoped worker threads. Inputs are borrowed read-only; results
//! come back in input order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{TrackResult, TrackingError};

/// Shared flag to abandon an in-flight cycle between evaluations.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> TrackResult<()> {
        if self.is_cancelled() {
            Err(TrackingError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Apply `f` to every item on up to `workers` threads, preserving order.
///
/// The first error stops the remaining workers at their next item. A panicking
/// worker surfaces as [`TrackingError::WorkerPanicked`].
pub fn evaluate_all<T, R, F>(items: &[T], workers: usize, cancel: &CancelToken, f: F) -> TrackResult<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> TrackResult<R> + Sync,
{
    cancel.check()?;
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let workers = workers.clamp(1, items.len());
    if workers == 1 {
        let serial = panic::catch_unwind(AssertUnwindSafe(|| {
            items
                .iter()
                .map(|item| {
                    cancel.check()?;
                    f(item)
                })
                .collect::<TrackResult<Vec<R>>>()
        }));
        return serial.map_err(|_| TrackingError::WorkerPanicked)?;
    }

    let chunk = items.len().div_ceil(workers);
    let abort = AtomicBool::new(false);
    let f = &f;
    let abort = &abort;

    let joined = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = items
            .chunks(chunk)
            .map(|part| {
                s.spawn(move |_| -> TrackResult<Vec<R>> {
                    let mut out = Vec::with_capacity(part.len());
                    for item in part {
                        cancel.check()?;
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        match f(item) {
                            Ok(r) => out.push(r),
                            Err(e) => {
                                abort.store(true, Ordering::Relaxed);
                                return Err(e);
                            }
                        }
                    }
                    Ok(out)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
    })
    .map_err(|_| TrackingError::WorkerPanicked)?;

    let mut results = Vec::with_capacity(items.len());
    let mut first_error = None;
    for part in joined {
        match part {
            Ok(Ok(values)) => results.extend(values),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(_) => return Err(TrackingError::WorkerPanicked),
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    cancel.check()?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preserves_order_across_workers() {
        let items: Vec<u32> = (0..103).collect();
        let cancel = CancelToken::new();
        for workers in [1, 2, 4, 16, 500] {
            let out = evaluate_all(&items, workers, &cancel, |&x| Ok(x * 2)).unwrap();
            assert_eq!(out, items.iter().map(|x| x * 2).collect::<Vec<_>>());
        }
        let empty: Vec<u32> = Vec::new();
        assert!(evaluate_all(&empty, 4, &cancel, |&x| Ok(x)).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = evaluate_all(&[1, 2, 3], 2, &cancel, |&x| Ok(x)).unwrap_err();
        assert_eq!(err, TrackingError::Cancelled);
        cancel.reset();
        assert!(evaluate_all(&[1, 2, 3], 2, &cancel, |&x| Ok(x)).is_ok());
    }

    #[test]
    fn test_cancel_mid_evaluation() {
        let cancel = CancelToken::new();
        let items: Vec<usize> = (0..40).collect();
        let err = evaluate_all(&items, 1, &cancel, |&x| {
            if x == 10 {
                cancel.cancel();
            }
            Ok(x)
        })
        .unwrap_err();
        assert_eq!(err, TrackingError::Cancelled);
    }

    #[test]
    fn test_error_propagates() {
        let cancel = CancelToken::new();
        let items: Vec<usize> = (0..64).collect();
        let err = evaluate_all(&items, 4, &cancel, |&x| {
            if x == 33 {
                Err(TrackingError::Oracle("render failed".to_string()))
            } else {
                Ok(x)
            }
        })
        .unwrap_err();
        assert_eq!(err, TrackingError::Oracle("render failed".to_string()));
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let cancel = CancelToken::new();
        let items: Vec<usize> = (0..8).collect();
        for workers in [1, 2] {
            let err = evaluate_all(&items, workers, &cancel, |&x| {
                if x == 7 {
                    panic!("oracle crashed");
                }
                Ok(x)
            })
            .unwrap_err();
            assert_eq!(err, TrackingError::WorkerPanicked, "workers = {}", workers);
        }
    }
}
