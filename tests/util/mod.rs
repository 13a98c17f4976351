//! Some nice utilities for writing automated tests for the load balancer and
//! the backends behind it, all running on the same tokio runtime.

#![allow(dead_code)]

pub mod backend;
pub mod config;
pub mod server;
pub mod tcp;
