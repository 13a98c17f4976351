use std::sync::{Mutex, MutexGuard, PoisonError};

use super::worker::{Failure, Worker};

/// Workers of one listener. The accept loop and the retry coordinator add
/// workers, the reaper removes the finished ones and the shutdown sequence
/// takes everything that's left. Once closed, the set doesn't accept new
/// workers anymore.
pub(crate) struct ActiveSet {
    inner: Mutex<Inner>,
}

struct Inner {
    workers: Vec<Worker>,
    closed: bool,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                workers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// The lock is never held across an `.await` and no code running with it
    /// can panic halfway through an update, so a poisoned lock still
    /// contains consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `worker` to the set. If the set is closed the worker is given
    /// back so the caller can stop it.
    pub fn push(&self, worker: Worker) -> Result<(), Worker> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(worker);
        }

        inner.workers.push(worker);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    /// Takes the failure of every worker that couldn't reach its backend.
    /// Each failure is returned exactly once, the failed workers remain in
    /// the set until the reaper gets to them.
    pub fn take_failures(&self) -> Vec<Failure> {
        self.lock()
            .workers
            .iter()
            .filter_map(Worker::take_failure)
            .collect()
    }

    /// Removes and returns the workers that are done.
    pub fn remove_reapable(&self) -> Vec<Worker> {
        let mut inner = self.lock();

        let (finished, running): (Vec<Worker>, Vec<Worker>) = std::mem::take(&mut inner.workers)
            .into_iter()
            .partition(Worker::is_reapable);

        inner.workers = running;

        finished
    }

    /// Closes the set and returns all the workers it contained.
    pub fn close(&self) -> Vec<Worker> {
        let mut inner = self.lock();
        inner.closed = true;

        std::mem::take(&mut inner.workers)
    }
}
