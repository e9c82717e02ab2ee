//! Command execution abstraction for testability.
//!
//! Every iptables and `ip` invocation goes through [`CommandExecutor`], so
//! unit tests can script tool behaviour (or simulate a whole rule table)
//! without root.

use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::retry::poll_until;

/// Upper bound on a single tool invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if the process was not killed by a signal
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(code),
        }
    }
}

/// Synchronous command executor.
///
/// An `Err` means the program could not be run at all (missing binary,
/// timeout). A program that ran and failed is an `Ok` with `success == false`.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute `program` with `args` and wait for it to finish.
    fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs real processes, killing any that outlive the timeout.
#[derive(Debug, Clone)]
pub struct RealCommandExecutor {
    timeout: Duration,
}

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RealCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", program))?;

        // Drain pipes on their own threads so a chatty child can't block on a
        // full pipe while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match poll_until(WAIT_POLL_INTERVAL, self.timeout, || {
            child.try_wait().transpose()
        }) {
            Ok(status) => status.with_context(|| format!("Failed to wait for {}", program))?,
            Err(_) => {
                kill(&mut child);
                anyhow::bail!("{} timed out after {:?}", program, self.timeout);
            }
        };

        Ok(CommandOutput {
            stdout: join_drain(stdout),
            stderr: join_drain(stderr),
            success: status.success(),
            code: status.code(),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).to_string()
        })
    })
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has issues with lifetimes in `&[&str]`, so the trait takes
/// `&[String]` instead.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
