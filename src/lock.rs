//! Host-wide xtables locking.
//!
//! iptables has no multi-process mutual exclusion of its own beyond an ad-hoc
//! convention, and that convention changed between releases:
//!
//! - iptables >= 1.6 takes `flock(LOCK_EX)` on `/run/xtables.lock`
//! - iptables 1.4.x binds the abstract unix socket `@xtables`
//!
//! Neither recognizes the other's lock, and we cannot know which release a
//! concurrent invoker uses, so [`XtablesLock`] holds both.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::IntoRawFd;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::{SocketAddr, UnixListener};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{HalfError, LockError, LockHalf};
use crate::retry::poll_until;

pub const DEFAULT_LOCK_FILE: &str = "/run/xtables.lock";
pub const DEFAULT_LOCK_NAME: &str = "xtables";
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the two lock halves live and how long to wait for each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Lock file for the flock half
    pub file: PathBuf,
    /// Abstract socket name, without the leading `@`
    pub abstract_name: String,
    pub poll_interval: Duration,
    /// Per-half acquisition timeout
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(DEFAULT_LOCK_FILE),
            abstract_name: DEFAULT_LOCK_NAME.to_string(),
            poll_interval: LOCK_POLL_INTERVAL,
            timeout: LOCK_TIMEOUT,
        }
    }
}

/// A guard holding both xtables lock halves.
///
/// Call [`XtablesLock::release`] to learn about release failures. Dropping an
/// unreleased guard still releases both halves and logs any failure.
#[derive(Debug)]
pub struct XtablesLock {
    file: Option<File>,
    socket: Option<UnixListener>,
}

type ReleaseFn = Box<dyn FnOnce() -> io::Result<()>>;

impl XtablesLock {
    /// Take the flock half, then the socket half. Both must succeed.
    ///
    /// A half that is merely held by someone else is retried every
    /// `poll_interval` until `timeout`. If the socket half times out the file
    /// half is released before returning.
    pub fn acquire(config: &LockConfig) -> Result<Self, LockError> {
        let mut lock = XtablesLock {
            file: None,
            socket: None,
        };

        let file = open_lock_file(&config.file)?;
        poll_until(config.poll_interval, config.timeout, || {
            file.try_lock_exclusive().ok()
        })
        .map_err(|_| LockError::Unavailable {
            half: LockHalf::File,
            timeout: config.timeout,
            cleanup: Vec::new(),
        })?;
        lock.file = Some(file);

        match poll_until(config.poll_interval, config.timeout, || {
            bind_abstract(&config.abstract_name).ok()
        }) {
            Ok(listener) => lock.socket = Some(listener),
            Err(_) => {
                let cleanup = lock.release_halves();
                return Err(LockError::Unavailable {
                    half: LockHalf::Socket,
                    timeout: config.timeout,
                    cleanup,
                });
            }
        }

        debug!(
            "Acquired xtables lock ({}, @{})",
            config.file.display(),
            config.abstract_name
        );
        Ok(lock)
    }

    /// Release both halves. Both are always attempted; every failure is
    /// reported.
    pub fn release(mut self) -> Result<(), LockError> {
        let errors = self.release_halves();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LockError::Release(errors))
        }
    }

    fn release_halves(&mut self) -> Vec<HalfError> {
        let mut halves: Vec<(LockHalf, ReleaseFn)> = Vec::with_capacity(2);
        if let Some(file) = self.file.take() {
            halves.push((LockHalf::File, Box::new(move || unlock_file(file))));
        }
        if let Some(socket) = self.socket.take() {
            halves.push((LockHalf::Socket, Box::new(move || close_socket(socket))));
        }
        release_each(halves)
    }
}

impl Drop for XtablesLock {
    fn drop(&mut self) {
        for err in self.release_halves() {
            warn!("Failed to release xtables lock on drop: {}", err);
        }
    }
}

/// Run every release, collecting failures instead of stopping at the first.
fn release_each<I>(halves: I) -> Vec<HalfError>
where
    I: IntoIterator<Item = (LockHalf, ReleaseFn)>,
{
    halves
        .into_iter()
        .filter_map(|(half, release)| release().err().map(|e| HalfError::new(half, e)))
        .collect()
}

/// Open (creating if needed) the lock file, owner read/write only on create.
/// An existing file keeps its mode: it is shared with iptables itself.
fn open_lock_file(path: &Path) -> Result<File, LockError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn unlock_file(file: File) -> io::Result<()> {
    FileExt::unlock(&file)
}

fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixListener::bind_addr(&addr)
}

fn close_socket(listener: UnixListener) -> io::Result<()> {
    let fd = listener.into_raw_fd();
    // SAFETY: into_raw_fd() hands us sole ownership of a valid descriptor,
    // which is closed exactly once here and never used again.
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Lock config with a private file and socket name, short timeouts.
    fn test_config(dir: &TempDir) -> LockConfig {
        let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        LockConfig {
            file: dir.path().join("xtables.lock"),
            abstract_name: format!("netpin-lock-test-{}-{}", std::process::id(), n),
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(60),
        }
    }

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.file, PathBuf::from("/run/xtables.lock"));
        assert_eq!(config.abstract_name, "xtables");
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_acquire_release() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let lock = XtablesLock::acquire(&config).unwrap();
        assert!(config.file.exists());
        lock.release().unwrap();

        // Both halves are free again
        let again = XtablesLock::acquire(&config).unwrap();
        again.release().unwrap();
    }

    #[test]
    fn test_lock_file_created_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let lock = XtablesLock::acquire(&config).unwrap();

        let mode = std::fs::metadata(&config.file).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        lock.release().unwrap();
    }

    #[test]
    fn test_second_acquire_times_out_on_file_half() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let held = XtablesLock::acquire(&config).unwrap();
        let err = XtablesLock::acquire(&config).unwrap_err();
        match err {
            LockError::Unavailable { half, cleanup, .. } => {
                assert_eq!(half, LockHalf::File);
                assert!(cleanup.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        held.release().unwrap();
    }

    #[test]
    fn test_socket_half_contention_releases_file_half() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        // Someone using the 1.4.x convention only
        let squatter = bind_abstract(&config.abstract_name).unwrap();

        let err = XtablesLock::acquire(&config).unwrap_err();
        match err {
            LockError::Unavailable { half, cleanup, .. } => {
                assert_eq!(half, LockHalf::Socket);
                assert!(cleanup.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        // The flock half must not have leaked
        let file = open_lock_file(&config.file).unwrap();
        assert!(file.try_lock_exclusive().is_ok());
        FileExt::unlock(&file).unwrap();

        drop(squatter);
        XtablesLock::acquire(&config).unwrap().release().unwrap();
    }

    #[test]
    fn test_waiter_gets_lock_after_holder_releases() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.timeout = Duration::from_secs(5);

        let held = XtablesLock::acquire(&config).unwrap();
        let waiter_config = config.clone();
        let waiter = std::thread::spawn(move || XtablesLock::acquire(&waiter_config));

        std::thread::sleep(Duration::from_millis(100));
        held.release().unwrap();

        let lock = waiter.join().unwrap().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn test_drop_releases_both_halves() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let _lock = XtablesLock::acquire(&config).unwrap();
        }

        XtablesLock::acquire(&config).unwrap().release().unwrap();
    }

    #[test]
    fn test_open_failure() {
        let config = LockConfig {
            file: PathBuf::from("/nonexistent-netpin-dir/xtables.lock"),
            ..LockConfig::default()
        };
        let err = XtablesLock::acquire(&config).unwrap_err();
        assert!(matches!(err, LockError::Open { .. }));
    }

    #[test]
    fn test_release_each_attempts_every_half() {
        let socket_released = Rc::new(Cell::new(false));
        let flag = Rc::clone(&socket_released);

        let halves: Vec<(LockHalf, ReleaseFn)> = vec![
            (
                LockHalf::File,
                Box::new(|| Err(io::Error::new(io::ErrorKind::Other, "unlock failed"))),
            ),
            (
                LockHalf::Socket,
                Box::new(move || {
                    flag.set(true);
                    Ok(())
                }),
            ),
        ];

        let errors = release_each(halves);
        assert!(socket_released.get());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].half, LockHalf::File);
    }

    #[test]
    fn test_release_each_collects_all_failures() {
        let halves: Vec<(LockHalf, ReleaseFn)> = vec![
            (
                LockHalf::File,
                Box::new(|| Err(io::Error::new(io::ErrorKind::Other, "a"))),
            ),
            (
                LockHalf::Socket,
                Box::new(|| Err(io::Error::new(io::ErrorKind::Other, "b"))),
            ),
        ];

        let errors = release_each(halves);
        let halves: Vec<LockHalf> = errors.iter().map(|e| e.half).collect();
        assert_eq!(halves, vec![LockHalf::File, LockHalf::Socket]);
    }
}
