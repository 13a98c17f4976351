use super::Scheduler;
use crate::{config::Backend, sync::ring::Ring};

/// Plain Round Robin (RR). Backends are chosen one after another in the order
/// they appear in the config file, weights are ignored. If we have 3 backend
/// servers A, B and C and receive 6 connections, this is how RR schedules
/// them: `[A, B, C, A, B, C]`.
#[derive(Debug)]
pub struct RoundRobin {
    backends: Ring<Backend>,
}

impl RoundRobin {
    /// Creates and initializes a new [`RoundRobin`] scheduler.
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends: Ring::new(backends),
        }
    }

    pub fn backends(&self) -> &[Backend] {
        self.backends.values()
    }
}

impl Scheduler for RoundRobin {
    fn next_backend(&self) -> &Backend {
        self.backends.next_as_ref()
    }
}
