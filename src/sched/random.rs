use rand::{seq::SliceRandom, Rng};

use super::Scheduler;
use crate::config::Backend;

/// Chooses a backend uniformly at random for every connection. There's no
/// state at all, so no guarantees about fairness over short periods either.
#[derive(Debug)]
pub struct Random {
    backends: Vec<Backend>,
}

impl Random {
    /// Creates a new [`Random`] scheduler. `backends` must not be empty.
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }
}

impl Scheduler for Random {
    fn next_backend(&self) -> &Backend {
        let index = rand::thread_rng().gen_range(0..self.backends.len());

        &self.backends[index]
    }
}

/// Random choice among all `backends` that are not the same server as
/// `excluded`. When nothing else is left, `excluded` is returned.
pub(super) fn choose_excluding<'a>(backends: &'a [Backend], excluded: &'a Backend) -> &'a Backend {
    let candidates: Vec<&Backend> = backends
        .iter()
        .filter(|backend| !backend.same_server(excluded))
        .collect();

    candidates
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(excluded)
}
