//! Drives `psql` as a black box: resolves connection settings, runs statements and SQL
//! files as subprocesses, and reads back the statistics the harness samples.

mod client;
pub mod config;
mod error;
pub mod metrics;
#[cfg(all(unix, any(test, feature = "testing")))]
pub mod testing;

pub use client::{Client, FileRun, OnError, QueryOutput, DEFAULT_PROGRAM};
pub use config::{ConnectionConfig, Settings, SslMode};
pub use error::Error;
pub use metrics::{Collector, WalMetrics};
