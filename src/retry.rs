//! Fixed-interval polling with a deadline.
//!
//! Both xtables lock halves and the command executor's child-process wait are
//! expressed as "try again every `interval` until `timeout`".

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The polled operation never produced a value before the deadline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("condition not met within {timeout:?} ({attempts} attempts)")]
pub struct PollTimeout {
    pub timeout: Duration,
    pub attempts: u32,
}

/// Call `op` until it returns `Some`, sleeping `interval` between attempts.
///
/// The first attempt happens immediately and one last attempt is always made
/// once the deadline is reached, so a zero `timeout` means exactly one try.
/// `None` from `op` is "not yet", never an error.
pub fn poll_until<T, F>(interval: Duration, timeout: Duration, mut op: F) -> Result<T, PollTimeout>
where
    F: FnMut() -> Option<T>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts = attempts.saturating_add(1);
        if let Some(value) = op() {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollTimeout { timeout, attempts });
        }
        thread::sleep(interval.min(deadline - now));
    }
}
