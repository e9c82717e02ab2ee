//! iptables-backed rule reconciler.

use std::time::Duration;

use tracing::{debug, warn};

use super::{is_locked_err, Rule, RuleReconciler};
use crate::cmd_abstraction::{CommandExecutor, CommandOutput};
use crate::error::ReconcileError;
use crate::lock::{LockConfig, XtablesLock};

/// Upper bound on check/delete rounds in one `ensure_absent` call.
pub const MAX_DELETE_ROUNDS: usize = 16;

/// How concurrent iptables invocations on the host are kept apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locking {
    /// Hold the dual xtables lock around every invocation.
    Host(LockConfig),
    /// Let the tool serialize itself via `-w <seconds>`. For hosts whose
    /// iptables flocks the same lock file, where holding it ourselves would
    /// make every invocation report the lock busy.
    ToolWait(Duration),
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Check,
    Insert,
    Delete,
}

impl Op {
    fn flag(self) -> &'static str {
        match self {
            Op::Check => "-C",
            Op::Insert => "-I",
            Op::Delete => "-D",
        }
    }
}

/// Reconciles rules by running `iptables` (or `ip6tables`) through a
/// [`CommandExecutor`].
pub struct IptablesReconciler<E> {
    executor: E,
    program: String,
    locking: Locking,
}

impl<E: CommandExecutor> IptablesReconciler<E> {
    pub fn new(executor: E, program: impl Into<String>, locking: Locking) -> Self {
        Self {
            executor,
            program: program.into(),
            locking,
        }
    }

    /// Run `op` while holding the host lock (if configured). The lock is
    /// released on every path; a release failure is logged and never replaces
    /// the result of `op`.
    fn with_lock<T>(
        &self,
        op: impl FnOnce() -> Result<T, ReconcileError>,
    ) -> Result<T, ReconcileError> {
        match &self.locking {
            Locking::Host(config) => {
                let lock = XtablesLock::acquire(config)?;
                let result = op();
                if let Err(err) = lock.release() {
                    warn!("{}", err);
                }
                result
            }
            Locking::ToolWait(_) => op(),
        }
    }

    fn build_args(&self, op: Op, rule: &Rule) -> Vec<String> {
        let mut args = Vec::with_capacity(rule.args().len() + 7);
        if let Locking::ToolWait(wait) = &self.locking {
            args.push("-w".to_string());
            args.push(wait.as_secs().max(1).to_string());
        }
        args.push("-t".to_string());
        args.push(rule.table().to_string());
        args.push(op.flag().to_string());
        args.push(rule.chain().to_string());
        if let Op::Insert = op {
            args.push("1".to_string());
        }
        args.extend(rule.args().iter().cloned());
        args
    }

    fn invoke(&self, op: Op, rule: &Rule) -> Result<CommandOutput, ReconcileError> {
        let args = self.build_args(op, rule);
        debug!("Running {} {}", self.program, args.join(" "));
        let output = self
            .executor
            .execute(&self.program, &args)
            .map_err(|e| ReconcileError::Exec {
                program: self.program.clone(),
                message: format!("{:#}", e),
            })?;

        if output.success {
            return Ok(output);
        }
        // `-C` exits 1 when the rule is absent
        if matches!(op, Op::Check) && output.code == Some(1) && !is_locked_err(&output.stderr) {
            return Ok(output);
        }
        Err(self.classify(&args, &output))
    }

    fn classify(&self, args: &[String], output: &CommandOutput) -> ReconcileError {
        let stderr = output.stderr.trim().to_string();
        if is_locked_err(&stderr) {
            ReconcileError::LockBusy {
                program: self.program.clone(),
                stderr,
            }
        } else {
            ReconcileError::Tool {
                program: self.program.clone(),
                args: args.join(" "),
                code: output.code,
                stderr,
            }
        }
    }

    fn exists(&self, rule: &Rule) -> Result<bool, ReconcileError> {
        Ok(self.invoke(Op::Check, rule)?.success)
    }
}

impl<E: CommandExecutor> RuleReconciler for IptablesReconciler<E> {
    fn ensure_present(&self, rule: &Rule) -> Result<bool, ReconcileError> {
        self.with_lock(|| {
            if self.exists(rule)? {
                return Ok(true);
            }
            self.invoke(Op::Insert, rule)?;
            Ok(false)
        })
    }

    fn ensure_absent(&self, rule: &Rule) -> Result<(), ReconcileError> {
        self.with_lock(|| {
            for _ in 0..MAX_DELETE_ROUNDS {
                if !self.exists(rule)? {
                    return Ok(());
                }
                self.invoke(Op::Delete, rule)?;
            }
            Err(ReconcileError::StillPresent {
                rule: rule.to_string(),
                rounds: MAX_DELETE_ROUNDS,
            })
        })
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), ReconcileError> {
        self.with_lock(|| self.invoke(Op::Delete, rule).map(|_| ()))
    }
}
