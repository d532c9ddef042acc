//! Error types for the scan agent.

use std::time::Duration;

use crate::retry::{Classify, ErrorKind};

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Aborted checks error: {0}")]
    Aborted(#[from] AbortedError),

    #[error("Container driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Agent address error: {0}")]
    Addr(#[from] AddrError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors querying the aborted checks service.
#[derive(Debug, thiserror::Error)]
pub enum AbortedError {
    #[error("Invalid aborted checks address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Request for aborted checks failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Error getting current aborted checks, unexpected status code: {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Error reading current aborted checks: {reason}")]
    Decode { reason: String },
}

impl Classify for AbortedError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Request(_) => ErrorKind::Transient,
            Self::InvalidAddress { .. } | Self::UnexpectedStatus { .. } | Self::Decode { .. } => {
                ErrorKind::Permanent
            }
        }
    }
}

/// Errors returned by a container driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Docker connection failed: {message}")]
    Connect { message: String },

    #[error("Docker operation {operation} for {target} failed: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("Docker object {target} not found")]
    NotFound { target: String },
}

impl Classify for DriverError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::Permanent,
            Self::Connect { .. } | Self::Operation { .. } => ErrorKind::Transient,
        }
    }
}

/// Terminal failure of a single check run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Error pulling image {image} for check {check_id}: {source}")]
    Pull {
        check_id: String,
        image: String,
        source: DriverError,
    },

    #[error("Error creating container for check {check_id}: {source}")]
    Create {
        check_id: String,
        source: DriverError,
    },

    #[error("Error starting container for check {check_id}: {source}")]
    Start {
        check_id: String,
        source: DriverError,
    },

    #[error("Error running container for check {check_id}: {source}")]
    Wait {
        check_id: String,
        source: DriverError,
    },

    #[error("Error reading logs for check {check_id}: {source}")]
    Logs {
        check_id: String,
        source: DriverError,
    },

    #[error("Check {check_id} cancelled")]
    Cancelled { check_id: String },

    #[error("Check {check_id} timed out after {timeout:?}")]
    Timeout { check_id: String, timeout: Duration },

    #[error("Check {check_id} run task ended without a result")]
    Dropped { check_id: String },
}

impl RunError {
    /// True for caller-initiated or deadline-driven terminations.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Timeout { .. })
    }
}

/// Job message errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job message {message_id}: {reason}")]
    InvalidMessage { message_id: String, reason: String },

    #[error("Check {check_id} is not running")]
    NotRunning { check_id: String },
}

/// Queue reading errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Error receiving message: {0}")]
    Receive(String),

    #[error("Error deleting message {id}: {reason}")]
    Delete { id: String, reason: String },

    #[error("Queue reading cancelled")]
    Cancelled,

    #[error("Queue task failed: {0}")]
    Task(String),
}

impl QueueError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// State update and results upload errors.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        source: reqwest::Error,
    },

    #[error("Report request to {endpoint} returned status {status}")]
    UnexpectedStatus { endpoint: String, status: u16 },

    #[error("Invalid report response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

impl Classify for ReportError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Request { .. } => ErrorKind::Transient,
            Self::UnexpectedStatus { status, .. } if *status >= 500 => ErrorKind::Transient,
            Self::UnexpectedStatus { .. } | Self::InvalidResponse { .. } => ErrorKind::Permanent,
        }
    }
}

/// Callback address discovery errors.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("Network interface {name} not found")]
    InterfaceNotFound { name: String },

    #[error("Failed to determine agent IPv4 address on interface {name}")]
    NoIpv4 { name: String },

    #[error("Error listing network interfaces: {0}")]
    Sys(#[from] nix::Error),
}

/// Errors draining the agent at shutdown.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("HTTP listener did not shut down within {timeout:?}")]
    ListenerTimeout { timeout: Duration },

    #[error("HTTP server stopped with error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Task {task} panicked: {reason}")]
    Panicked { task: &'static str, reason: String },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
