//! Sharded worker pool for log passes.
//!
//! A path always hashes to the same shard, so passes for one session run in
//! the order they were scheduled. A path that is queued but not started is not
//! queued again. The path leaves the queued set before its handler runs, so an
//! event that lands mid-pass schedules one more pass.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::MonitorError;

type Handler = dyn Fn(&Path) + Send + Sync;

pub struct WorkerPool {
    shards: Vec<Sender<PathBuf>>,
    queued: Arc<Mutex<HashSet<PathBuf>>>,
    /// Queued plus running passes.
    outstanding: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

/// Decrements the outstanding count even if the handler panics.
struct PassGuard(Arc<AtomicUsize>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new<F>(threads: usize, handler: F) -> Result<Self, MonitorError>
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        let handler: Arc<Handler> = Arc::new(handler);
        let queued = Arc::new(Mutex::new(HashSet::new()));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let mut shards = Vec::new();
        let mut handles = Vec::new();

        for index in 0..threads.max(1) {
            let (tx, rx) = mpsc::channel::<PathBuf>();
            let handler = Arc::clone(&handler);
            let queued = Arc::clone(&queued);
            let outstanding = Arc::clone(&outstanding);
            let name = format!("session-worker-{}", index);

            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    while let Ok(path) = rx.recv() {
                        let _guard = PassGuard(Arc::clone(&outstanding));
                        match queued.lock() {
                            Ok(mut set) => {
                                set.remove(&path);
                            }
                            Err(poisoned) => {
                                poisoned.into_inner().remove(&path);
                            }
                        }
                        handler(&path);
                    }
                })
                .map_err(|source| MonitorError::Spawn { name, source })?;

            shards.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            shards,
            queued,
            outstanding,
            handles,
        })
    }

    pub fn threads(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, path: &Path) -> usize {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue a pass for `path`. Returns false when one is already waiting.
    pub fn schedule(&self, path: &Path) -> bool {
        {
            let mut queued = match self.queued.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !queued.insert(path.to_path_buf()) {
                return false;
            }
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.shards[self.shard_of(path)]
            .send(path.to_path_buf())
            .is_err()
        {
            // Shard thread is gone
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            if let Ok(mut queued) = self.queued.lock() {
                queued.remove(path);
            }
            tracing::error!(path = %path.display(), "worker shard stopped, dropping pass");
            return false;
        }
        true
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Block until no pass is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Finish queued passes and stop the threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shards.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Receiver;

    fn recording_pool(
        threads: usize,
    ) -> (WorkerPool, Arc<Mutex<Vec<PathBuf>>>, Receiver<PathBuf>, Sender<()>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let recorded = Arc::clone(&calls);
        let pool = WorkerPool::new(threads, move |path: &Path| {
            started_tx.send(path.to_path_buf()).unwrap();
            gate_rx.lock().unwrap().recv().unwrap();
            recorded.lock().unwrap().push(path.to_path_buf());
        })
        .unwrap();
        (pool, calls, started_rx, gate_tx)
    }

    // =============================================================================
    // Coalescing Tests
    // =============================================================================

    #[test]
    fn test_queued_path_is_not_queued_twice() {
        let (pool, calls, started, gate) = recording_pool(1);
        let a = PathBuf::from("/p/a.jsonl");
        let b = PathBuf::from("/p/b.jsonl");

        assert!(pool.schedule(&a));
        assert_eq!(started.recv().unwrap(), a);

        // a is running, b waits behind it
        assert!(pool.schedule(&b));
        assert!(!pool.schedule(&b));
        assert!(!pool.schedule(&b));

        // An event during a's pass queues a follow-up pass
        assert!(pool.schedule(&a));
        assert!(!pool.schedule(&a));

        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(*calls.lock().unwrap(), vec![a.clone(), b, a]);
    }

    #[test]
    fn test_schedule_after_pass_runs_again() {
        let (pool, calls, _started, gate) = recording_pool(2);
        let a = PathBuf::from("/p/a.jsonl");
        gate.send(()).unwrap();
        assert!(pool.schedule(&a));
        assert!(pool.wait_idle(Duration::from_secs(5)));
        gate.send(()).unwrap();
        assert!(pool.schedule(&a));
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    // =============================================================================
    // Sharding Tests
    // =============================================================================

    #[test]
    fn test_path_maps_to_stable_shard() {
        let pool = WorkerPool::new(4, |_: &Path| {}).unwrap();
        assert_eq!(pool.threads(), 4);
        for i in 0..50 {
            let path = PathBuf::from(format!("/p/{}.jsonl", i));
            let shard = pool.shard_of(&path);
            assert!(shard < 4);
            assert_eq!(shard, pool.shard_of(&path));
        }
    }

    #[test]
    fn test_zero_threads_still_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let pool = WorkerPool::new(0, move |_: &Path| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(pool.threads(), 1);
        pool.schedule(Path::new("/p/x.jsonl"));
        assert!(pool.wait_idle(Duration::from_secs(5)));
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
