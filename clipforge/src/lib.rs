//! clipforge: a local-first, crash-resilient batch clip pipeline.
//!
//! A SQLite manifest tracks every input artifact through a closed job
//! state machine; workers claim jobs atomically, supervise external
//! encoder invocations under dual watchdogs, and record verified
//! outputs. Two-tier content fingerprinting plus a configuration
//! fingerprint decide, per artifact, whether work is owed at all.

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod scan;

pub use error::{Error, Result};
