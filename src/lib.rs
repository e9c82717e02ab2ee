//! # netpin - keep proxy iptables rules and address pinned on a node
//!
//! A node-local sidecar that installs a fixed battery of iptables rules and a
//! local IP address for a TCP proxy endpoint, re-asserts them on an interval
//! (other actors may remove them at any time), and removes them on exit.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        netpin                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap) + Config (serde_yaml)                           │
//! │    └── Settings: address, port, interface, interval, flags  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Controller (tokio interval + ShutdownToken)                │
//! │    ├── Initializing: one pass                               │
//! │    ├── SteadyState: a pass every interval                   │
//! │    └── Draining: remove rules, then the address             │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  RuleReconciler              │  AddressManager              │
//! │    └── IptablesReconciler    │    └── NetifManager (ip)     │
//! ├──────────────────────────────┤                              │
//! │  XtablesLock (flock + @sock) │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  CommandExecutor (std::process, mockall in tests)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use netpin::cmd_abstraction::RealCommandExecutor;
//! use netpin::controller::{Controller, ControllerOptions};
//! use netpin::netif::NetifManager;
//! use netpin::reconciler::{proxy_rules, IptablesReconciler, Locking};
//! use netpin::lock::LockConfig;
//! use netpin::signal::{spawn_signal_listener, ShutdownToken};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let address: ipnet::IpNet = "100.64.0.1/32".parse()?;
//!     let rules = proxy_rules(address.addr(), 443);
//!
//!     let reconciler = IptablesReconciler::new(
//!         RealCommandExecutor::new(),
//!         "iptables",
//!         Locking::Host(LockConfig::default()),
//!     );
//!     let addresses = NetifManager::new(RealCommandExecutor::new(), "ip", address, "lo");
//!
//!     let mut controller = Controller::new(
//!         rules,
//!         reconciler,
//!         addresses,
//!         ControllerOptions {
//!             interval: Duration::from_secs(5),
//!             manage_rules: true,
//!             daemon: true,
//!             cleanup: true,
//!         },
//!     );
//!
//!     let shutdown = ShutdownToken::new();
//!     spawn_signal_listener(shutdown.clone());
//!     controller.run(shutdown).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Command execution abstraction (mockable)
//! - [`config`] - Configuration parsing and validation
//! - [`controller`] - Reconciliation state machine
//! - [`error`] - Error types
//! - [`lock`] - Host-wide dual xtables lock
//! - [`netif`] - Local address assignment
//! - [`reconciler`] - Rule model and idempotent rule reconciliation
//! - [`retry`] - Fixed-interval polling with a deadline
//! - [`signal`] - Graceful shutdown signal handling

pub mod cli;
pub mod cmd_abstraction;
pub mod config;
pub mod controller;
pub mod error;
pub mod lock;
pub mod netif;
pub mod reconciler;
pub mod retry;
pub mod signal;

pub use cli::{Cli, Commands};
pub use config::{Config, Settings};
pub use error::NetpinError;
