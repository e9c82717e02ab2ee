//! CLI argument parsing with clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "netpin")]
#[command(author, version, about = "Keeps proxy iptables rules and address pinned on a Linux node")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path (default: /etc/netpin/config.yaml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Install rules and address, then keep them in place (default)
    Run,

    /// Print the rule battery for the configured address and port
    Rules,

    /// Show version information
    Version,
}

/// Flags that override values from the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Local IP address of the proxy
    #[arg(long, global = true)]
    pub ip_address: Option<String>,

    /// Local TCP port of the proxy
    #[arg(long, global = true)]
    pub local_port: Option<u16>,

    /// Interface to bind the address to
    #[arg(long, global = true)]
    pub interface: Option<String>,

    /// Reconciliation interval (e.g. 5s, 1m)
    #[arg(long, global = true)]
    pub interval: Option<String>,

    /// Manage iptables rules
    #[arg(long, global = true, value_name = "BOOL")]
    pub setup_iptables: Option<bool>,

    /// Keep running and re-assert periodically
    #[arg(long, global = true, value_name = "BOOL")]
    pub daemon: Option<bool>,

    /// Remove rules and address on exit
    #[arg(long, global = true, value_name = "BOOL")]
    pub cleanup: Option<bool>,

    /// Hold the host-wide xtables lock around iptables calls
    #[arg(long, global = true, value_name = "BOOL")]
    pub host_lock: Option<bool>,
}

impl Overrides {
    /// Apply every flag that was given on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(ref ip) = self.ip_address {
            config.ip_address = ip.clone();
        }
        if let Some(port) = self.local_port {
            config.local_port = port;
        }
        if let Some(ref interface) = self.interface {
            config.interface = interface.clone();
        }
        if let Some(ref interval) = self.interval {
            config.interval = interval.clone();
        }
        if let Some(v) = self.setup_iptables {
            config.setup_iptables = v;
        }
        if let Some(v) = self.daemon {
            config.daemon = v;
        }
        if let Some(v) = self.cleanup {
            config.cleanup = v;
        }
        if let Some(v) = self.host_lock {
            config.host_lock = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_none() {
        let cli = Cli::parse_from(["netpin"]);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_overrides_after_subcommand() {
        let cli = Cli::parse_from([
            "netpin",
            "run",
            "--ip-address",
            "100.64.0.1",
            "--local-port",
            "443",
            "--interval",
            "5s",
            "--daemon",
            "true",
            "--cleanup",
            "false",
        ]);
        assert_eq!(cli.command, Some(Commands::Run));

        let mut config = Config::default();
        cli.overrides.apply(&mut config);
        assert_eq!(config.ip_address, "100.64.0.1");
        assert_eq!(config.local_port, 443);
        assert_eq!(config.interval, "5s");
        assert!(config.daemon);
        assert!(!config.cleanup);
    }

    #[test]
    fn test_empty_overrides_keep_config() {
        let mut config = Config {
            ip_address: "10.0.0.1".to_string(),
            ..Config::default()
        };
        let before = config.clone();
        Overrides::default().apply(&mut config);
        assert_eq!(config, before);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result = Cli::try_parse_from(["netpin", "--local-port", "70000"]);
        assert!(result.is_err());
    }
}
