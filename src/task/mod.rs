//! This module defines the architecture of the load balancer, which we call
//! "master-server" because each listening socket in the config file gets its
//! own [`server::Server`], and the [`master::Master`] spawns and stops all of
//! them. Since we're working with [`tokio`], processing units are tasks, see
//! [`tokio::task`]. Each server runs these tasks:
//!
//! ```text
//!                        +--------+
//!                        | Server |
//!                        +--------+
//!                             |
//!          +------------------+------------------+
//!          |                  |                  |
//!          v                  v                  v
//!    +----------+      +-------------+     +--------+
//!    |  Accept  |      |    Retry    |     | Reaper |
//!    +----------+      +-------------+     +--------+
//!          |                  |
//!          | dispatch         | re-dispatch failed connections
//!          v                  v
//!    +----------+      +----------+      +----------+
//!    | Worker 1 |      | Worker 2 |      | Worker 3 |
//!    +----------+      +----------+      +----------+
//! ```
//!
//! Workers are tracked in an [`active::ActiveSet`], which together with the
//! flags of each worker is the only state shared between tasks. Everything
//! else is either owned by a single task or immutable.

pub(crate) mod active;
pub(crate) mod master;
pub(crate) mod reaper;
pub(crate) mod retry;
pub(crate) mod server;
pub(crate) mod shutdown;
pub(crate) mod worker;
