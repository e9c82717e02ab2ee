//! The reconciliation controller.
//!
//! ```text
//! Idle -> Initializing -> SteadyState -> Draining -> Stopped
//!                   \___________(no daemon)____^   (no cleanup: skip Draining)
//! ```
//!
//! Every pass re-asserts the whole battery plus the address. There is no diff
//! against remembered state: `ensure_present` is a no-op for rules that are
//! still there, and re-inserts the ones someone else removed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::NetpinError;
use crate::netif::AddressManager;
use crate::reconciler::{Rule, RuleReconciler};
use crate::signal::ShutdownToken;

/// Upper bound on delete/probe rounds per rule during teardown.
pub const MAX_TEARDOWN_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Initializing,
    SteadyState,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub interval: Duration,
    /// Manage the rule battery (the address is always managed)
    pub manage_rules: bool,
    pub daemon: bool,
    pub cleanup: bool,
}

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub already_present: usize,
    pub added: usize,
    pub lock_contended: usize,
    pub failed: usize,
    pub address_ok: bool,
}

/// The synchronous half of the controller. Every method here may block on
/// the xtables lock or on a child process, so the async side only ever
/// calls it through `spawn_blocking`.
struct Passes<R, A> {
    rules: Vec<Rule>,
    reconciler: R,
    addresses: A,
    options: ControllerOptions,
}

pub struct Controller<R, A> {
    passes: Arc<Passes<R, A>>,
    state: ControllerState,
}

impl<R, A> Controller<R, A>
where
    R: RuleReconciler + 'static,
    A: AddressManager + 'static,
{
    pub fn new(rules: Vec<Rule>, reconciler: R, addresses: A, options: ControllerOptions) -> Self {
        Self {
            passes: Arc::new(Passes {
                rules,
                reconciler,
                addresses,
                options,
            }),
            state: ControllerState::Idle,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn rules(&self) -> &[Rule] {
        &self.passes.rules
    }

    fn transition(&mut self, next: ControllerState) {
        debug!("Controller state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Drive the full lifecycle until `shutdown` (daemon mode) or after the
    /// initial pass. Returns the teardown error, if teardown ran and failed.
    pub async fn run(&mut self, shutdown: ShutdownToken) -> Result<(), NetpinError> {
        self.transition(ControllerState::Initializing);
        self.checks_off_runtime().await;

        if self.passes.options.daemon {
            self.transition(ControllerState::SteadyState);
            info!("Running as a daemon, re-checking every {:?}", self.passes.options.interval);
            self.run_periodic(&shutdown).await;
        }

        let result = if self.passes.options.cleanup {
            self.transition(ControllerState::Draining);
            let passes = Arc::clone(&self.passes);
            task::spawn_blocking(move || passes.teardown())
                .await
                .map_err(NetpinError::from)
                .and_then(|result| result)
        } else {
            Ok(())
        };

        self.transition(ControllerState::Stopped);
        result
    }

    async fn run_periodic(&self, shutdown: &ShutdownToken) {
        let period = self.passes.options.interval;
        let Some(start) = Instant::now().checked_add(period) else {
            warn!("Interval {:?} is out of range, only waiting for shutdown", period);
            shutdown.cancelled().await;
            return;
        };
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!("Exiting rule/address check loop");
                    return;
                }
                _ = ticker.tick() => {
                    if shutdown.is_cancelled() {
                        continue;
                    }
                    self.checks_off_runtime().await;
                }
            }
        }
    }

    /// One pass on the blocking pool. A pass that dies is logged and the
    /// next tick tries again.
    async fn checks_off_runtime(&self) -> PassSummary {
        let passes = Arc::clone(&self.passes);
        match task::spawn_blocking(move || passes.run_checks()).await {
            Ok(summary) => summary,
            Err(err) => {
                error!("Reconciliation pass failed: {}", err);
                PassSummary::default()
            }
        }
    }

    /// One full pass: `ensure_present` on every rule in order, then the
    /// address. Errors are logged per rule and never abort the pass.
    ///
    /// Blocks the calling thread.
    pub fn run_checks(&self) -> PassSummary {
        self.passes.run_checks()
    }

    /// Remove every rule, then the address. Rule failures are logged; the
    /// address removal error is returned.
    ///
    /// Blocks the calling thread.
    pub fn teardown(&self) -> Result<(), NetpinError> {
        self.passes.teardown()
    }
}

impl<R: RuleReconciler, A: AddressManager> Passes<R, A> {
    fn run_checks(&self) -> PassSummary {
        let mut summary = PassSummary::default();

        if self.options.manage_rules {
            for rule in &self.rules {
                match self.reconciler.ensure_present(rule) {
                    Ok(true) => {
                        debug!("iptables rule {} already exists", rule);
                        summary.already_present += 1;
                    }
                    Ok(false) => {
                        info!("Added back rule - {}", rule);
                        summary.added += 1;
                    }
                    Err(err) if err.is_retryable() => {
                        info!(
                            "Error checking/adding iptables rule {}, due to xtables lock in use, retrying in {:?}: {}",
                            rule, self.options.interval, err
                        );
                        summary.lock_contended += 1;
                    }
                    Err(err) => {
                        error!("Error adding iptables rule {} - {}", rule, err);
                        summary.failed += 1;
                    }
                }
            }
        }

        debug!("Ensuring ip address");
        match self.addresses.ensure_ip_address() {
            Ok(()) => {
                debug!("Ensured ip address");
                summary.address_ok = true;
            }
            Err(err) => error!("Error ensuring ip address: {}", err),
        }

        summary
    }

    fn teardown(&self) -> Result<(), NetpinError> {
        info!("Cleaning up");

        if self.options.manage_rules {
            for rule in &self.rules {
                self.drain_rule(rule);
            }
        }

        self.addresses.remove_ip_address()?;
        info!("Successfully cleaned up everything");
        Ok(())
    }

    /// Delete `rule`, probing with `ensure_present` until the probe says it
    /// was gone, then delete once more since that probe re-inserted it.
    ///
    /// The probe can itself race a concurrent writer and re-create a rule
    /// being deleted; the loop bound keeps that from spinning forever.
    fn drain_rule(&self, rule: &Rule) {
        let mut rounds = 0;
        loop {
            if let Err(err) = self.reconciler.ensure_absent(rule) {
                error!("Error deleting iptables rule {} - {}", rule, err);
            }
            rounds += 1;

            let existed = matches!(self.reconciler.ensure_present(rule), Ok(true));
            if !existed {
                break;
            }
            if rounds >= MAX_TEARDOWN_ROUNDS {
                warn!("iptables rule {} kept reappearing after {} rounds", rule, rounds);
                break;
            }
        }

        if let Err(err) = self.reconciler.delete_rule(rule) {
            error!("Error deleting iptables rule {} - {}", rule, err);
        }
    }
}
