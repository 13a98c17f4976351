//! Log output of the binary. Everything else only uses [`tracing`] macros.

use tracing::Level;
use tracing_subscriber::{fmt::writer::MakeWriterExt, prelude::*, EnvFilter};

/// Installs the global subscriber. Filtering is controlled with `RUST_LOG`
/// and defaults to `info`. Warnings and errors go to stderr, everything else
/// to stdout.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();
}
