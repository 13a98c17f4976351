//! Configuration factories for integrations tests.

use std::time::Duration;

use tlb::config::{Algorithm, Backend, Endpoint, Listener, Timings};

/// Same steps as the defaults, but short enough for tests.
pub fn fast_timings() -> Timings {
    Timings {
        bind_retry: Duration::from_millis(50),
        accept_pause: Duration::from_millis(10),
        reaper_grace: Duration::from_millis(10),
        reaper_interval: Duration::from_millis(20),
        reaper_join: Duration::from_millis(10),
        retry_interval: Duration::from_millis(10),
        retry_idle_interval: Duration::from_millis(50),
        retry_idle_after: 5,
        drain_pause: Duration::from_millis(100),
        drain_join: Duration::from_millis(20),
        drain_force_join: Duration::from_millis(50),
        background_join: Duration::from_millis(200),
    }
}

/// Listener on a random local port.
pub fn listener(backends: Vec<Backend>, algorithm: Algorithm) -> Listener {
    listener_on(Endpoint::new("127.0.0.1", 0), backends, algorithm)
}

pub fn listener_on(bind: Endpoint, backends: Vec<Backend>, algorithm: Algorithm) -> Listener {
    let mut listener = Listener::new(bind, backends, algorithm);
    listener.connect_timeout = Duration::from_secs(1);
    listener.timings = fast_timings();

    listener
}

pub fn round_robin(backends: Vec<Backend>) -> Listener {
    listener(backends, Algorithm::RoundRobin)
}
