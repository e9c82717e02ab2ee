//! Local address assignment through iproute2.
//!
//! The proxy endpoint's address must stay bound to a local interface, just
//! like its firewall rules must stay installed. [`NetifManager`] makes both
//! directions idempotent so it can be re-run every reconciliation pass.

use ipnet::IpNet;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput};
use crate::error::AddressError;

/// Idempotent control over one address on one interface.
#[cfg_attr(test, automock)]
pub trait AddressManager: Send + Sync {
    /// Bind the address unless it is already bound.
    fn ensure_ip_address(&self) -> Result<(), AddressError>;

    /// Unbind the address. Already gone (or interface gone) is success.
    fn remove_ip_address(&self) -> Result<(), AddressError>;
}

/// [`AddressManager`] driving the `ip` tool.
pub struct NetifManager<E> {
    executor: E,
    ip_path: String,
    address: IpNet,
    interface: String,
}

impl<E: CommandExecutor> NetifManager<E> {
    pub fn new(executor: E, ip_path: impl Into<String>, address: IpNet, interface: impl Into<String>) -> Self {
        Self {
            executor,
            ip_path: ip_path.into(),
            address,
            interface: interface.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput, AddressError> {
        debug!("Running {} {}", self.ip_path, args.join(" "));
        self.executor
            .execute(&self.ip_path, &args_to_strings(args))
            .map_err(|e| AddressError::Exec {
                program: self.ip_path.clone(),
                message: format!("{:#}", e),
            })
    }

    fn command_error(&self, op: &'static str, output: &CommandOutput) -> AddressError {
        AddressError::Command {
            op,
            address: self.address.to_string(),
            interface: self.interface.clone(),
            stderr: output.stderr.trim().to_string(),
        }
    }

    /// Addresses currently bound to the interface.
    fn bound_addresses(&self) -> Result<Vec<IpNet>, AddressError> {
        let output = self.run(&["-o", "addr", "show", "dev", self.interface.as_str()])?;
        if !output.success {
            if output.stderr.contains("does not exist") {
                return Err(AddressError::InterfaceNotFound(self.interface.clone()));
            }
            return Err(self.command_error("list addresses for", &output));
        }
        Ok(parse_addresses(&output.stdout))
    }

    fn is_bound(&self) -> Result<bool, AddressError> {
        Ok(self
            .bound_addresses()?
            .iter()
            .any(|net| net.addr() == self.address.addr()))
    }
}

impl<E: CommandExecutor> AddressManager for NetifManager<E> {
    fn ensure_ip_address(&self) -> Result<(), AddressError> {
        if self.is_bound()? {
            debug!("Address {} already bound to {}", self.address, self.interface);
            return Ok(());
        }

        let address = self.address.to_string();
        let output = self.run(&["addr", "add", address.as_str(), "dev", self.interface.as_str()])?;
        if !output.success {
            return Err(self.command_error("add", &output));
        }
        info!("Added address {} to {}", self.address, self.interface);
        Ok(())
    }

    fn remove_ip_address(&self) -> Result<(), AddressError> {
        match self.is_bound() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(AddressError::InterfaceNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        }

        let address = self.address.to_string();
        let output = self.run(&["addr", "del", address.as_str(), "dev", self.interface.as_str()])?;
        if !output.success {
            return Err(self.command_error("remove", &output));
        }
        info!("Removed address {} from {}", self.address, self.interface);
        Ok(())
    }
}

/// Parse `ip -o addr show` output into the listed prefixes.
///
/// Line format: `2: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0\ ...`
fn parse_addresses(output: &str) -> Vec<IpNet> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields
                .windows(2)
                .find(|w| w[0] == "inet" || w[0] == "inet6")
                .and_then(|w| w[1].parse().ok())
        })
        .collect()
}
