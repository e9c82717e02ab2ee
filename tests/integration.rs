//! Integration tests for netpin.
//!
//! Tests touching the real firewall require root and are marked #[ignore].
//! Run with: `sudo cargo test --release -- --ignored`

use std::process::{Command, Output};

/// Check if running as root
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Run netpin with `args` and return its output
fn run_netpin(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_netpin"))
        .args(args)
        .output()
        .expect("Failed to execute netpin")
}

#[test]
fn test_version_command() {
    let output = run_netpin(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("netpin "));
}

#[test]
fn test_help_command() {
    let output = run_netpin(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("rules"));
    assert!(stdout.contains("--ip-address"));
}

#[test]
fn test_rules_command_prints_battery() {
    let output = run_netpin(&[
        "rules",
        "--ip-address",
        "100.64.0.1",
        "--local-port",
        "443",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "iptables -t raw PREROUTING -p tcp -d 100.64.0.1 --dport 443 -j NOTRACK",
            "iptables -t filter INPUT -p tcp -d 100.64.0.1 --dport 443 -j ACCEPT",
            "iptables -t raw OUTPUT -p tcp -s 100.64.0.1 --sport 443 -j NOTRACK",
            "iptables -t filter OUTPUT -p tcp -s 100.64.0.1 --sport 443 -j ACCEPT",
            "iptables -t raw OUTPUT -p tcp -d 100.64.0.1 --dport 443 -j NOTRACK",
        ]
    );
}

#[test]
fn test_rules_command_ipv6_uses_ip6tables() {
    let output = run_netpin(&["rules", "--ip-address", "fd00::1"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 5);
    assert!(stdout.lines().all(|l| l.starts_with("ip6tables ")));
}

#[test]
fn test_malformed_address_fails() {
    let output = run_netpin(&["rules", "--ip-address", "100.64.0.300"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unable to parse IP address"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_file_fails() {
    let output = run_netpin(&["rules", "--config", "/nonexistent/netpin.yaml"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_run_requires_root() {
    if is_root() {
        return;
    }
    let output = run_netpin(&["run", "--ip-address", "100.64.0.1", "--daemon", "false"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("requires root"), "stderr: {}", stderr);
}

/// List one iptables chain in `-S` form.
fn list_chain(table: &str, chain: &str) -> String {
    let output = Command::new("iptables")
        .args(["-t", table, "-S", chain])
        .output()
        .expect("Failed to run iptables");
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
#[ignore] // Requires root and iptables
fn test_one_shot_install_and_cleanup() {
    if !is_root() {
        eprintln!("Skipping test_one_shot_install_and_cleanup: requires root");
        return;
    }

    // iptables-legacy flocks /run/xtables.lock itself, so holding it on our
    // side would make every call report the lock busy there. `-w` works with
    // both legacy and nft backends.

    // Install only
    let output = run_netpin(&[
        "run",
        "--ip-address",
        "100.64.0.1",
        "--local-port",
        "443",
        "--daemon",
        "false",
        "--cleanup",
        "false",
        "--host-lock",
        "false",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(list_chain("raw", "PREROUTING").contains("-d 100.64.0.1/32 -p tcp -m tcp --dport 443 -j NOTRACK"));

    // Install again (no duplicates), then tear down
    let output = run_netpin(&[
        "run",
        "--ip-address",
        "100.64.0.1",
        "--local-port",
        "443",
        "--daemon",
        "false",
        "--cleanup",
        "true",
        "--host-lock",
        "false",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(!list_chain("raw", "PREROUTING").contains("100.64.0.1"));
    assert!(!list_chain("raw", "OUTPUT").contains("100.64.0.1"));
    assert!(!list_chain("filter", "INPUT").contains("100.64.0.1"));
    assert!(!list_chain("filter", "OUTPUT").contains("100.64.0.1"));
}
