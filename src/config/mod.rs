//! Structs and enums derived from the config file using [`serde`].

mod deser;

use std::{collections::HashSet, fmt, path::Path, str::FromStr, time::Duration};

use deser::BackendOption;
use serde::Deserialize;

use crate::Error;

/// This struct represents the entire configuration file, which describes
/// global options and a list of listeners. For example, this configuration:
///
/// ```toml
/// algorithm = "round_robin"
/// buffer_size = 4096
///
/// [[listener]]
///
/// listen = "127.0.0.1:8000"
/// backends = ["127.0.0.1:9000", "127.0.0.1:9001"]
///
/// [[listener]]
///
/// listen = ["127.0.0.1:8100", "127.0.0.1:8101"]
/// backends = [{ address = "127.0.0.1:9100", weight = 2 }]
/// ```
///
/// Should result in a [`Vec`] containing two [`Mapping`] elements after
/// deserializing, and three [`Listener`] instances after calling
/// [`Config::listeners`].
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default scheduling algorithm for all listeners.
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Maximum number of bytes read from a socket in one go.
    #[serde(default = "default::buffer_size")]
    pub buffer_size: usize,

    /// How long a worker waits for a backend to accept the connection before
    /// reporting it as failed.
    #[serde(default = "default::connect_timeout", with = "deser::seconds")]
    pub connect_timeout: Duration,

    /// Time that all listeners are given to shut down before the process
    /// exits anyway.
    #[serde(default = "default::grace_period", with = "deser::seconds")]
    pub grace_period: Duration,

    /// List of all the port mappings.
    #[serde(rename = "listener")]
    pub mappings: Vec<Mapping>,

    /// Internal intervals and timeouts. They can't be set from the config
    /// file, but tests need shorter values.
    #[serde(skip)]
    pub timings: Timings,
}

/// Description of a single `[[listener]]` instance in the config file.
///
/// ```toml
/// [[listener]]
///
/// name = "web"
/// listen = ["0.0.0.0:80", "[::]:80"]
/// algorithm = "weighted_round_robin"
/// backends = [
///     "10.0.0.2:8080",
///     { address = "10.0.0.3:8080", weight = 3 },
///     { address = "app.internal", port = 8080, weight = 2 },
/// ]
/// ```
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Mapping {
    /// Local addresses where this mapping listens.
    #[serde(deserialize_with = "deser::one_or_many")]
    pub listen: Vec<Endpoint>,

    /// Upstream servers, in the order used by the round robin schedulers.
    pub backends: Vec<Backend>,

    /// Optional name to show in logs.
    pub name: Option<String>,

    /// Overrides [`Config::algorithm`] for this mapping only.
    pub algorithm: Option<Algorithm>,

    /// Overrides [`Config::buffer_size`] for this mapping only.
    pub buffer_size: Option<usize>,
}

/// Host and port pair written as `"host:port"` in the config file. IPv6
/// addresses must be wrapped in brackets: `"[::1]:8080"`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String")]
pub struct Endpoint {
    /// IP address or host name.
    pub address: String,

    /// TCP port.
    pub port: u16,
}

/// One element in the `backends` list. This represents an upstream server
/// and its weight, which only matters for weighted round robin.
///
/// ```toml
/// [[listener]]
///
/// listen = "127.0.0.1:8000"
/// backends = [
///     "127.0.0.1:8080",                                   # Weight 1
///     { address = "127.0.0.1:8081", weight = 2 },         # Address with port
///     { address = "127.0.0.1", port = 8082, weight = 3 }, # Separate port
/// ]
/// ```
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "BackendOption")]
pub struct Backend {
    /// IP address or host name of the upstream server.
    pub address: String,

    /// TCP port of the upstream server.
    pub port: u16,

    /// Servers with bigger weights receive proportionally more connections
    /// when using [`Algorithm::WeightedRoundRobin`].
    pub weight: usize,
}

/// Algorithm that should be used for load balancing.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Uniform random choice for every connection.
    Random,

    /// Backends are chosen one after another in list order.
    #[default]
    RoundRobin,

    /// Like round robin, but each backend is chosen `weight` times in a row.
    WeightedRoundRobin,
}

/// Everything a single listening socket needs to run. One of these is
/// created for every address in [`Mapping::listen`], so a mapping that
/// listens on two addresses becomes two independent listeners ("replicas")
/// that share the same backends.
#[derive(Debug, Clone)]
pub struct Listener {
    /// Local address to bind.
    pub bind: Endpoint,

    /// Upstream servers.
    pub backends: Vec<Backend>,

    /// Scheduling algorithm.
    pub algorithm: Algorithm,

    /// Relay chunk size.
    pub buffer_size: usize,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Intervals used by the background tasks and the shutdown sequence.
    pub timings: Timings,

    /// Log name includes the bind address and also the optional name set
    /// by the user.
    pub log_name: String,
}

/// Fixed intervals and timeouts of the listener tasks. The defaults are the
/// values the load balancer runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Pause between bind attempts.
    pub bind_retry: Duration,

    /// Pause after an `accept` error before accepting again.
    pub accept_pause: Duration,

    /// Delay before the reaper runs for the first time.
    pub reaper_grace: Duration,

    /// Pause between reaper passes.
    pub reaper_interval: Duration,

    /// How long the reaper waits on each finished worker.
    pub reaper_join: Duration,

    /// Retry scan interval while failures are being found.
    pub retry_interval: Duration,

    /// Retry scan interval once things are quiet.
    pub retry_idle_interval: Duration,

    /// Consecutive scans without failures before switching to
    /// [`Timings::retry_idle_interval`].
    pub retry_idle_after: u32,

    /// Pause given to workers after they've been asked to stop, repeated
    /// before the second join pass.
    pub drain_pause: Duration,

    /// First join timeout for each worker on shutdown.
    pub drain_join: Duration,

    /// Second, longer join timeout for workers that didn't stop in time.
    pub drain_force_join: Duration,

    /// Join timeout for the reaper and the retry coordinator.
    pub background_join: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            bind_retry: Duration::from_secs(5),
            accept_pause: Duration::from_secs(3),
            reaper_grace: Duration::from_secs(2),
            reaper_interval: Duration::from_millis(1500),
            reaper_join: Duration::from_millis(20),
            retry_interval: Duration::from_millis(50),
            retry_idle_interval: Duration::from_secs(2),
            retry_idle_after: 5,
            drain_pause: Duration::from_secs(1),
            drain_join: Duration::from_millis(30),
            drain_force_join: Duration::from_millis(200),
            background_join: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Reads, parses and validates the config file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::ReadConfig {
                path: path.to_path_buf(),
                source,
            })?;

        content.parse()
    }

    /// Checks everything that can't be expressed with [`serde`] attributes.
    pub fn validate(&self) -> Result<(), Error> {
        if self.mappings.is_empty() {
            return Err(invalid("at least one [[listener]] is required"));
        }

        if self.buffer_size == 0 {
            return Err(invalid("'buffer_size' must be greater than 0"));
        }

        if self.connect_timeout.is_zero() {
            return Err(invalid("'connect_timeout' must be greater than 0"));
        }

        if self.grace_period.is_zero() {
            return Err(invalid("'grace_period' must be greater than 0"));
        }

        let mut seen = HashSet::new();

        for mapping in &self.mappings {
            if mapping.listen.is_empty() {
                return Err(invalid("every [[listener]] needs a 'listen' address"));
            }

            for endpoint in &mapping.listen {
                if !seen.insert(endpoint) {
                    return Err(invalid(format!("duplicated listen address {endpoint}")));
                }
            }

            if mapping.backends.is_empty() {
                return Err(invalid(format!(
                    "listener {} has no backends",
                    mapping.listen[0]
                )));
            }

            if let Some(backend) = mapping.backends.iter().find(|b| b.weight == 0) {
                return Err(invalid(format!("backend {backend} has weight 0")));
            }

            if mapping.buffer_size == Some(0) {
                return Err(invalid(format!(
                    "listener {} has 'buffer_size' 0",
                    mapping.listen[0]
                )));
            }
        }

        Ok(())
    }

    /// Flattens all the mappings into one [`Listener`] per listen address.
    pub fn listeners(&self) -> Vec<Listener> {
        let mut listeners = Vec::new();

        for mapping in &self.mappings {
            for bind in &mapping.listen {
                let log_name = match &mapping.name {
                    Some(name) => format!("{bind} ({name})"),
                    None => bind.to_string(),
                };

                listeners.push(Listener {
                    bind: bind.clone(),
                    backends: mapping.backends.clone(),
                    algorithm: mapping.algorithm.unwrap_or(self.algorithm),
                    buffer_size: mapping.buffer_size.unwrap_or(self.buffer_size),
                    connect_timeout: self.connect_timeout,
                    timings: self.timings,
                    log_name,
                });
            }
        }

        listeners
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;

        Ok(config)
    }
}

impl Listener {
    /// Listener with default settings for the given addresses. Mostly useful
    /// for tests and embedding, the binary builds these from [`Config`].
    pub fn new(bind: Endpoint, backends: Vec<Backend>, algorithm: Algorithm) -> Self {
        Self {
            log_name: bind.to_string(),
            bind,
            backends,
            algorithm,
            buffer_size: default::buffer_size(),
            connect_timeout: default::connect_timeout(),
            timings: Timings::default(),
        }
    }
}

impl Endpoint {
    /// Creates a new [`Endpoint`].
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl Backend {
    /// Creates a new [`Backend`].
    pub fn new(address: impl Into<String>, port: u16, weight: usize) -> Self {
        Self {
            address: address.into(),
            port,
            weight,
        }
    }

    /// Two backends are the same server if they share address and port, the
    /// weight doesn't matter.
    pub fn same_server(&self, other: &Backend) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_host_port(f, &self.address, self.port)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_host_port(f, &self.address, self.port)
    }
}

fn write_host_port(f: &mut fmt::Formatter<'_>, address: &str, port: u16) -> fmt::Result {
    if address.contains(':') {
        write!(f, "[{address}]:{port}")
    } else {
        write!(f, "{address}:{port}")
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig(message.into())
}

mod default {
    //! Default values for some configuration options.

    use std::time::Duration;

    pub fn buffer_size() -> usize {
        4096
    }

    pub fn connect_timeout() -> Duration {
        Duration::from_secs(3)
    }

    pub fn grace_period() -> Duration {
        Duration::from_secs(4)
    }
}

/// Printed by `tlb --help-config`.
pub const HELP: &str = r#"Configuration file (TOML)

Global options:

    algorithm = "round_robin"   # random | round_robin | weighted_round_robin
    buffer_size = 4096          # bytes read from a socket at once
    connect_timeout = 3         # seconds to wait for a backend
    grace_period = 4            # seconds given to listeners on shutdown

Listeners (one or more):

    [[listener]]
    name = "web"                          # optional, used in logs
    listen = "0.0.0.0:8080"               # or a list: ["0.0.0.0:8080", "[::]:8080"]
    algorithm = "weighted_round_robin"    # optional override
    buffer_size = 8192                    # optional override
    backends = [
        "127.0.0.1:9000",
        { address = "127.0.0.1:9001", weight = 3 },
        { address = "app.internal", port = 9002, weight = 2 },
    ]
"#;
