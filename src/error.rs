//! Error types for netpin.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetpinError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("Reconciliation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One of the two independent halves of the xtables lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockHalf {
    /// flock(2) on the lock file (iptables >= 1.6 convention)
    File,
    /// Abstract unix socket bind (iptables 1.4 convention)
    Socket,
}

impl fmt::Display for LockHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHalf::File => f.write_str("file lock"),
            LockHalf::Socket => f.write_str("abstract socket lock"),
        }
    }
}

/// Failure to release one lock half.
#[derive(Error, Debug)]
#[error("{half}: {source}")]
pub struct HalfError {
    pub half: LockHalf,
    #[source]
    pub source: io::Error,
}

impl HalfError {
    pub fn new(half: LockHalf, source: io::Error) -> Self {
        Self { half, source }
    }
}

fn join_errors(errors: &[HalfError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn cleanup_suffix(errors: &[HalfError]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(" (cleanup also failed: {})", join_errors(errors))
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Failed to open xtables lock file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {timeout:?} waiting for the {half}{}", cleanup_suffix(.cleanup))]
    Unavailable {
        half: LockHalf,
        timeout: Duration,
        /// Errors hit while releasing the half that had already been taken
        cleanup: Vec<HalfError>,
    },

    #[error("Failed to release xtables lock: {}", join_errors(.0))]
    Release(Vec<HalfError>),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{program} reports another app is holding the xtables lock: {stderr}")]
    LockBusy { program: String, stderr: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{program} {args} failed (exit code {code:?}): {stderr}")]
    Tool {
        program: String,
        args: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to execute {program}: {message}")]
    Exec { program: String, message: String },

    #[error("Rule {rule} still present after {rounds} delete rounds")]
    StillPresent { rule: String, rounds: usize },
}

impl ReconcileError {
    /// Contention on either our own lock or the tool's lock. Expected on busy
    /// hosts and simply retried on the next pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::LockBusy { .. }
                | ReconcileError::Lock(LockError::Unavailable { .. })
        )
    }
}

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Interface {0} not found")]
    InterfaceNotFound(String),

    #[error("Failed to {op} {address} on {interface}: {stderr}")]
    Command {
        op: &'static str,
        address: String,
        interface: String,
        stderr: String,
    },

    #[error("Failed to execute {program}: {message}")]
    Exec { program: String, message: String },
}
