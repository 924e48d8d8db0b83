//! Minimal RPC framework: pooled client connections and a TCP server that
//! dispatches `Service.Method` calls to registered services.

pub mod arith;
pub mod config;
pub mod error;
pub mod logging;
pub mod rpc;

pub use error::{Error, Result};
