//! Custom deserialization for the configuration file.

use std::{fmt, time::Duration};

use serde::{
    de::{self, Visitor},
    Deserialize,
    Deserializer,
};

use super::{Backend, Endpoint};

/// See [`one_or_many`] for details.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// Helper for deserializing any type `T` into [`Vec<T>`]. This is useful for
/// configurations that allow omitting the array syntax. For example this TOML:
///
/// ```toml
/// [[listener]]
///
/// listen = "127.0.0.1:8100"
/// ```
///
/// Should be deserialized as if an array was written instead:
///
/// ```toml
/// [[listener]]
///
/// listen = ["127.0.0.1:8100"]
/// ```
pub(super) fn one_or_many<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Ok(OneOrMany::deserialize(deserializer)?.into())
}

/// Splits `"host:port"` into its parts. Brackets around IPv6 hosts are
/// removed, so `"[::1]:80"` becomes `("::1", 80)`.
fn split_host_port(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("'{value}' should be written as 'host:port'"))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| format!("unclosed bracket in '{value}'"))?,
        None if host.contains(':') => {
            return Err(format!("IPv6 address in '{value}' must be wrapped in brackets"))
        }
        None => host,
    };

    if host.is_empty() {
        return Err(format!("missing host in '{value}'"));
    }

    let port = port
        .parse()
        .map_err(|_| format!("invalid port in '{value}'"))?;

    Ok((String::from(host), port))
}

impl TryFrom<String> for Endpoint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (address, port) = split_host_port(&value)?;

        Ok(Self { address, port })
    }
}

/// Allows specifying the upstream servers as a `"host:port"` string or an
/// object containing the address and weight. The port can be part of the
/// address or a separate key.
///
/// ```toml
/// [[listener]]
///
/// listen = "127.0.0.1:8000"
///
/// backends = [
///     "127.0.0.1:8080",
///     { address = "127.0.0.1:8081", weight = 3 },
///     { address = "127.0.0.1", port = 8082, weight = 2 },
/// ]
/// ```
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(super) enum BackendOption {
    Simple(Endpoint),
    Detailed(DetailedBackend),
}

/// Table form of [`BackendOption`]. Unknown keys are rejected, otherwise a
/// misspelled `weight` would silently become 1.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub(super) struct DetailedBackend {
    address: String,
    port: Option<u16>,
    #[serde(default = "weight")]
    weight: usize,
}

fn weight() -> usize {
    1
}

impl TryFrom<BackendOption> for Backend {
    type Error = String;

    fn try_from(value: BackendOption) -> Result<Self, Self::Error> {
        let (address, port, weight) = match value {
            BackendOption::Simple(endpoint) => (endpoint.address, endpoint.port, 1),

            BackendOption::Detailed(DetailedBackend {
                address,
                port: Some(port),
                weight,
            }) => {
                if address.starts_with('[') || split_host_port(&address).is_ok() {
                    return Err(format!(
                        "backend '{address}' specifies the port twice, remove 'port' or the ':{port}' suffix"
                    ));
                }
                (address, port, weight)
            }

            BackendOption::Detailed(DetailedBackend {
                address,
                port: None,
                weight,
            }) => {
                let (address, port) = split_host_port(&address)?;
                (address, port, weight)
            }
        };

        Ok(Self {
            address,
            port,
            weight,
        })
    }
}

pub(super) mod seconds {
    //! Durations are written as seconds, integer or float.

    use super::*;

    struct SecondsVisitor;

    impl<'de> Visitor<'de> for SecondsVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a non-negative number of seconds")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("durations can't be negative"))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
            Duration::try_from_secs_f64(value).map_err(E::custom)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(SecondsVisitor)
    }
}
