use std::sync::atomic::{AtomicUsize, Ordering};

use super::Scheduler;
use crate::config::Backend;

/// Classical Weighted Round Robin (WRR) algorithm. Each backend server is
/// assigned a weight to distinguish its processing capabilities from others.
/// The normal Round Robin (RR) algorithm doesn't care about the processing
/// power of each server, so if we have 3 backend servers A, B and C and receive
/// 6 connections, this is how RR schedules them: `[A, B, C, A, B, C]`.
///
/// On the other hand, WRR sends more connections to the servers that have more
/// computing power. If we have 3 servers A, B and C with weights 1, 3 and 2,
/// this is how WRR schedules the 6 connections from before:
/// `[A, B, B, B, C, C]`.
///
/// Each server gets its whole share in a row, the cycle is not interleaved.
/// Over one full cycle the proportions are exact, but the traffic reaching a
/// single server is bursty.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    backends: Vec<Backend>,

    /// Prefix sums of the weights. For weights `[1, 3, 2]` this is `[1, 4, 6]`
    /// and the position of a tick in the cycle is found by looking for the
    /// first sum strictly greater than the tick.
    cumulative_weights: Vec<usize>,

    /// Length of one complete cycle.
    total_weight: usize,

    /// Ticks handed out so far. Taken modulo `total_weight`.
    cursor: AtomicUsize,
}

impl WeightedRoundRobin {
    /// Creates and initializes a new [`WeightedRoundRobin`] scheduler. The
    /// total weight must not be 0.
    pub fn new(backends: Vec<Backend>) -> Self {
        let cumulative_weights: Vec<usize> = backends
            .iter()
            .scan(0, |sum, backend| {
                *sum += backend.weight;
                Some(*sum)
            })
            .collect();

        let total_weight = cumulative_weights.last().copied().unwrap_or(0);

        Self {
            backends,
            cumulative_weights,
            total_weight,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }
}

impl Scheduler for WeightedRoundRobin {
    fn next_backend(&self) -> &Backend {
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed) % self.total_weight;
        let index = self.cumulative_weights.partition_point(|&sum| sum <= tick);

        &self.backends[index]
    }
}
