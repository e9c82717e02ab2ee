//! Rule reconciliation: make one rule's presence in the kernel match the
//! desired state, one tool invocation at a time.

mod iptables;
mod rule;

use tracing::debug;

#[cfg(test)]
use mockall::automock;

pub use iptables::{IptablesReconciler, Locking, MAX_DELETE_ROUNDS};
pub use rule::{proxy_rules, Chain, Rule, Table};

use crate::error::{NetpinError, ReconcileError};

/// Substring iptables prints when its own lock is held by someone else.
pub const LOCKED_ERR_MARKER: &str = "holding the xtables lock";

/// Idempotent presence control over a single rule.
///
/// Implementations hold no memory of earlier calls: every call re-checks the
/// kernel, since anyone on the host may change the ruleset at any time.
#[cfg_attr(test, automock)]
pub trait RuleReconciler: Send + Sync {
    /// Insert `rule` at the head of its chain unless present.
    /// Returns whether it already existed.
    fn ensure_present(&self, rule: &Rule) -> Result<bool, ReconcileError>;

    /// Delete every instance of `rule`. Absent is success.
    fn ensure_absent(&self, rule: &Rule) -> Result<(), ReconcileError>;

    /// One unconditional delete, without checking first.
    fn delete_rule(&self, rule: &Rule) -> Result<(), ReconcileError>;
}

/// True if tool stderr says the xtables lock is held elsewhere.
pub fn is_locked_err(stderr: &str) -> bool {
    stderr.contains(LOCKED_ERR_MARKER)
}

/// Check if running as root (effective UID == 0)
///
/// Both iptables and address assignment need CAP_NET_ADMIN; UID 0 covers the
/// common case of running as a privileged sidecar or via sudo.
pub fn check_root() -> Result<(), NetpinError> {
    // SAFETY: geteuid() has no preconditions, never fails and doesn't modify
    // any state.
    let euid = unsafe { libc::geteuid() };
    debug!("Effective UID: {}", euid);

    if euid != 0 {
        return Err(NetpinError::Permission(
            "managing iptables rules and addresses requires root (or CAP_NET_ADMIN)"
                .to_string(),
        ));
    }
    Ok(())
}
