pub mod config;
pub mod logging;
pub mod sched;
pub mod signal;

mod error;
mod sync;
mod task;

pub use config::Config;
pub use error::Error;
pub use task::{
    master::Master,
    server::{Server, ShutdownState, State},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
