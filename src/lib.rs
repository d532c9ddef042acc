//! Scan agent — runs queued checks as Docker containers.

pub mod aborted;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod report;
pub mod retry;
pub mod runner;
pub mod shutdown;

pub use error::{Error, Result};
