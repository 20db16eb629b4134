use crate::error::{Result, SubcompError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared flag checked by every worker between two work items
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-size pool for per-row numeric work.
///
/// Workers pull row indices from a shared atomic counter, so expensive rows
/// don't stall a statically assigned partition. Work stops early when the
/// cancel token is set or the deadline passes.
pub struct WorkerPool {
    pool: ThreadPool,
    num_threads: usize,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl WorkerPool {
    /// `None` sizes the pool to the available CPUs
    pub fn new(num_threads: Option<usize>) -> Result<Self> {
        let num_threads = num_threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("subcomp-worker-{}", i))
            .build()
            .map_err(|e| SubcompError::InvalidInput(format!("Failed to start worker pool: {}", e)))?;
        Ok(Self {
            pool,
            num_threads,
            cancel: CancelToken::new(),
            deadline: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with `Cancelled` if the pool was stopped
    pub fn check(&self, stage: &'static str) -> Result<()> {
        if self.is_cancelled() {
            Err(SubcompError::Cancelled { stage })
        } else {
            Ok(())
        }
    }

    /// `f(i)` for every `i` in `0..n`, returned in index order. Blocks until
    /// all workers have finished.
    pub fn map_rows<T, F>(&self, stage: &'static str, n: usize, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> T + Sync,
    {
        let next = AtomicUsize::new(0);
        let stopped = AtomicBool::new(false);
        let finished: Mutex<Vec<Vec<(usize, T)>>> = Mutex::new(Vec::with_capacity(self.num_threads));

        self.pool.scope(|scope| {
            for _ in 0..self.num_threads.min(n) {
                scope.spawn(|_| {
                    let mut local = Vec::new();
                    loop {
                        if self.is_cancelled() {
                            stopped.store(true, Ordering::Relaxed);
                            break;
                        }
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        if i >= n {
                            break;
                        }
                        local.push((i, f(i)));
                    }
                    finished
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(local);
                });
            }
        });

        if stopped.load(Ordering::Relaxed) {
            return Err(SubcompError::Cancelled { stage });
        }

        let mut slots: Vec<Option<T>> = (0..n).map(|_| None).collect();
        let finished = finished.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (i, value) in finished.into_iter().flatten() {
            slots[i] = Some(value);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rows_keeps_index_order() {
        let pool = WorkerPool::new(Some(4)).unwrap();
        let squares = pool.map_rows("test", 1000, |i| i * i).unwrap();
        assert_eq!(squares.len(), 1000);
        assert!(squares.iter().enumerate().all(|(i, &s)| s == i * i));
        assert!(pool.map_rows("test", 0, |i| i).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_token_stops_work() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let token = pool.cancel_token();
        let result = pool.map_rows("test", 10_000, |i| {
            if i == 10 {
                token.cancel();
            }
            i
        });
        assert!(matches!(result, Err(SubcompError::Cancelled { stage: "test" })));
        assert!(pool.check("test").is_err());
    }

    #[test]
    fn test_expired_deadline() {
        let pool = WorkerPool::new(Some(1)).unwrap().with_timeout(Duration::ZERO);
        assert!(pool.is_cancelled());
        assert!(pool.map_rows("test", 5, |i| i).is_err());
    }
}
