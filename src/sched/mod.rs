//! Load balancing and scheduler implementations.

mod random;
mod rr;
mod wrr;

pub use random::Random;
pub use rr::RoundRobin;
pub use wrr::WeightedRoundRobin;

use crate::config::{Algorithm, Backend};

/// A scheduler provides an algorithm for load balancing between multiple
/// backend servers.
pub trait Scheduler {
    /// Returns the backend that should receive the next connection.
    fn next_backend(&self) -> &Backend;
}

/// This is used mainly to avoid working with `dyn` traits. The algorithm is
/// chosen in the config file, so we don't know the exact scheduler type at
/// compile time, but there are only three of them and they all fit nicely in
/// an enum that is [`Send`] and [`Sync`] without boxing.
#[derive(Debug)]
pub enum Policy {
    Random(Random),
    RoundRobin(RoundRobin),
    Wrr(WeightedRoundRobin),
}

impl Policy {
    /// Creates the scheduler for the given [`Algorithm`]. Returns [`None`] if
    /// there are no backends to choose from or all of them have weight 0.
    pub fn new(algorithm: Algorithm, backends: Vec<Backend>) -> Option<Self> {
        if backends.is_empty() || backends.iter().all(|backend| backend.weight == 0) {
            return None;
        }

        Some(match algorithm {
            Algorithm::Random => Self::Random(Random::new(backends)),
            Algorithm::RoundRobin => Self::RoundRobin(RoundRobin::new(backends)),
            Algorithm::WeightedRoundRobin => Self::Wrr(WeightedRoundRobin::new(backends)),
        })
    }

    /// All the backends this policy schedules, in config order.
    pub fn backends(&self) -> &[Backend] {
        match self {
            Self::Random(random) => random.backends(),
            Self::RoundRobin(rr) => rr.backends(),
            Self::Wrr(wrr) => wrr.backends(),
        }
    }

    /// Picks the backend that should get a second chance at a connection
    /// after `failed` couldn't be reached. The choice is always random and
    /// ignores weights. If there's only one server there is no alternative,
    /// so `failed` itself is returned.
    pub fn replacement_for<'a>(&'a self, failed: &'a Backend) -> &'a Backend {
        random::choose_excluding(self.backends(), failed)
    }
}

impl Scheduler for Policy {
    fn next_backend(&self) -> &Backend {
        match self {
            Self::Random(random) => random.next_backend(),
            Self::RoundRobin(rr) => rr.next_backend(),
            Self::Wrr(wrr) => wrr.next_backend(),
        }
    }
}
