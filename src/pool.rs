//! Stage-scoped worker pool.
//!
//! A run creates one [`WorkerPool`] and hands it by reference to every stage.
//! A stage is a data-parallel map over independent units (blocks or files);
//! [`WorkerPool::run_units`] returns only when every dispatched unit has
//! finished, which makes each stage a full barrier.
//!
//! # Failure handling
//!
//! The first failing unit raises an abort flag. Units that have not started
//! yet are skipped; units already running finish normally. Every failure is
//! collected and returned together as [`Error::Stage`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{Error, Result};

pub struct WorkerPool {
    pool:    ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("v8unpack-worker-{i}"))
            .build()
            .map_err(|e| Error::InvalidOption(format!("cannot start worker pool: {e}")))?;
        Ok(Self { pool, workers })
    }

    /// One worker per available CPU; used when unpacking.
    pub fn for_unpack() -> Result<Self> {
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::new(workers)
    }

    /// A single worker; packing needs a non-interleaved view of sibling files.
    pub fn for_pack() -> Result<Self> {
        Self::new(1)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` over every unit and wait for all of them.
    pub fn run_units<T, F>(&self, stage: &'static str, units: Vec<T>, f: F) -> Result<()>
    where
        T: Send,
        F: Fn(T) -> Result<()> + Send + Sync,
    {
        let total = units.len();
        let abort = AtomicBool::new(false);
        let failures = Mutex::new(Vec::new());

        self.pool.install(|| {
            units.into_par_iter().for_each(|unit| {
                if abort.load(Ordering::Acquire) {
                    return;
                }
                if let Err(err) = f(unit) {
                    abort.store(true, Ordering::Release);
                    failures.lock().unwrap_or_else(|p| p.into_inner()).push(err);
                }
            });
        });

        let failures = failures.into_inner().unwrap_or_else(|p| p.into_inner());
        if failures.is_empty() {
            debug!(stage, units = total, "stage complete");
            Ok(())
        } else {
            Err(Error::Stage { stage, failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_every_unit() {
        let pool = WorkerPool::new(4).unwrap();
        let count = AtomicUsize::new(0);
        pool.run_units("count", (0..100).collect(), |_| {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn serial_pool_stops_dispatching_after_failure() {
        let pool = WorkerPool::for_pack().unwrap();
        let ran = AtomicUsize::new(0);
        let err = pool
            .run_units("fail", (0..10).collect(), |i: i32| {
                ran.fetch_add(1, Ordering::Relaxed);
                if i == 0 {
                    Err(Error::malformed("boom"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        match err {
            Error::Stage { stage, failures } => {
                assert_eq!(stage, "fail");
                assert_eq!(failures.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ran.load(Ordering::Relaxed) < 10);
    }
}
