//! netpin - keep proxy iptables rules and address pinned on a Linux node.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use netpin::cli::{Cli, Commands};
use netpin::cmd_abstraction::RealCommandExecutor;
use netpin::config::{Config, Settings};
use netpin::controller::{Controller, ControllerOptions};
use netpin::netif::NetifManager;
use netpin::reconciler::{check_root, proxy_rules, IptablesReconciler};
use netpin::signal::{spawn_signal_listener, ShutdownToken};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = cli.command.unwrap_or(Commands::Run);
    if command == Commands::Version {
        println!("netpin {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);
    let settings = config.into_settings().context("Invalid configuration")?;

    match command {
        Commands::Rules => {
            for rule in proxy_rules(settings.address.addr(), settings.local_port) {
                println!("{} {}", settings.iptables_path, rule);
            }
            Ok(())
        }
        Commands::Run => run(settings).await,
        Commands::Version => Ok(()),
    }
}

async fn run(settings: Settings) -> Result<()> {
    check_root()?;
    info!(
        "Using IP address {} on {} (port {})",
        settings.address.addr(),
        settings.interface,
        settings.local_port
    );

    let rules = proxy_rules(settings.address.addr(), settings.local_port);
    let reconciler = IptablesReconciler::new(
        RealCommandExecutor::new(),
        settings.iptables_path.clone(),
        settings.locking.clone(),
    );
    let addresses = NetifManager::new(
        RealCommandExecutor::new(),
        settings.ip_path.clone(),
        settings.address,
        settings.interface.clone(),
    );

    let mut controller = Controller::new(
        rules,
        reconciler,
        addresses,
        ControllerOptions {
            interval: settings.interval,
            manage_rules: settings.setup_iptables,
            daemon: settings.daemon,
            cleanup: settings.cleanup,
        },
    );

    let shutdown = ShutdownToken::new();
    let _signals = spawn_signal_listener(shutdown.clone());

    // A failed teardown is fatal: exit non-zero so the supervisor notices
    controller.run(shutdown).await.context("Failed to clean up")?;

    info!("Exiting... Bye!");
    Ok(())
}
