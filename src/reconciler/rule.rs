//! The rule model and the fixed rule battery.

use std::fmt;
use std::net::IpAddr;

/// iptables table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    /// Evaluated before connection tracking
    Raw,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in iptables chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One firewall rule. Two rules are the same rule iff table, chain and the
/// argument vector are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    table: Table,
    chain: Chain,
    args: Vec<String>,
}

impl Rule {
    pub fn new<I, S>(table: Table, chain: Chain, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table,
            chain,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Match and target arguments, e.g. `-p tcp -d 10.0.0.1 -j ACCEPT`
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {}", self.table, self.chain)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The rule battery for a locally terminated TCP endpoint `address:port`.
///
/// Traffic to and from the endpoint skips connection tracking (raw table),
/// and matching ACCEPT rules in the filter table stand in for the
/// `ESTABLISHED,RELATED` rules that no longer see those flows.
pub fn proxy_rules(address: IpAddr, port: u16) -> Vec<Rule> {
    let addr = address.to_string();
    let port = port.to_string();
    let flow = |dir: &str, port_dir: &str, target: &str| {
        vec![
            "-p".to_string(),
            "tcp".to_string(),
            dir.to_string(),
            addr.clone(),
            port_dir.to_string(),
            port.clone(),
            "-j".to_string(),
            target.to_string(),
        ]
    };

    vec![
        // Inbound to the endpoint: no conntrack
        Rule::new(Table::Raw, Chain::Prerouting, flow("-d", "--dport", "NOTRACK")),
        Rule::new(Table::Filter, Chain::Input, flow("-d", "--dport", "ACCEPT")),
        // Replies from the endpoint
        Rule::new(Table::Raw, Chain::Output, flow("-s", "--sport", "NOTRACK")),
        Rule::new(Table::Filter, Chain::Output, flow("-s", "--sport", "ACCEPT")),
        // Locally generated requests to the endpoint (hostNetwork clients)
        Rule::new(Table::Raw, Chain::Output, flow("-d", "--dport", "NOTRACK")),
    ]
}
