use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use tokio::process::Command;
use tracing::{info, warn};

use crate::core::net;
use crate::error::{Error, Result};

/// Kernel-level UDP forwarding: one DNAT + MASQUERADE pair per VM.
///
/// The `(port, guest_ip, ext_if)` tuple is recorded before the iptables
/// calls so teardown still knows the interface if the default route moves.
pub struct NatTable {
    rules: Mutex<HashMap<String, NatRule>>,
}

#[derive(Debug, Clone)]
struct NatRule {
    port: u16,
    guest_ip: Ipv4Addr,
    ext_if: String,
}

impl NatTable {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Install forwarding for one VM. The host port must equal the guest
    /// port: mosh negotiates a single port for both ends, so an asymmetric
    /// mapping can never carry its traffic.
    pub async fn start(
        &self,
        vm_id: &str,
        host_port: u16,
        guest_ip: Ipv4Addr,
        guest_port: u16,
    ) -> Result<()> {
        if host_port != guest_port {
            return Err(Error::InvalidArgument(format!(
                "udp forwarding requires host port == guest port (got {host_port} != {guest_port})"
            )));
        }

        let ext_if = net::detect_default_interface()
            .await
            .map_err(|err| Error::Backend(format!("cannot resolve external interface: {err}")))?;

        let rule = NatRule {
            port: host_port,
            guest_ip,
            ext_if: ext_if.clone(),
        };
        self.rules
            .lock()
            .unwrap()
            .insert(vm_id.to_string(), rule.clone());

        if let Err(err) = install_rules(&rule).await {
            remove_rules(&rule).await;
            self.rules.lock().unwrap().remove(vm_id);
            return Err(Error::Backend(format!(
                "failed to install udp nat rules: {err}"
            )));
        }

        // The iptables wrappers swallow some failures, so trust only what
        // the kernel reports back.
        let saved = read_nat_rules().await?;
        if !rules_installed(&saved, rule.port, rule.guest_ip) {
            remove_rules(&rule).await;
            self.rules.lock().unwrap().remove(vm_id);
            return Err(Error::Backend(format!(
                "udp nat rules for port {host_port} not observable after install"
            )));
        }

        Ok(())
    }

    /// Remove forwarding for one VM. Idempotent.
    pub async fn stop(&self, vm_id: &str) {
        let rule = self.rules.lock().unwrap().remove(vm_id);
        if let Some(rule) = rule {
            remove_rules(&rule).await;
        }
    }

    /// Delete every DNAT/MASQUERADE pair pointing into the guest subnet.
    /// Runs once at startup, before recovery reinstalls rules for
    /// surviving VMs. Best-effort.
    pub async fn cleanup_orphans(&self) -> usize {
        let saved = match read_nat_rules().await {
            Ok(saved) => saved,
            Err(err) => {
                warn!("[reconcile] could not read nat rules: {err}");
                return 0;
            }
        };

        let mut removed = 0;
        for line in orphan_rule_lines(&saved) {
            let Some(args) = delete_args_from_saved_line(&line) else {
                continue;
            };
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            net::run_cmd_ignore("iptables", &arg_refs).await;
            info!("[reconcile] removed stale nat rule: {line}");
            removed += 1;
        }
        removed
    }
}

async fn install_rules(rule: &NatRule) -> anyhow::Result<()> {
    let port = rule.port.to_string();
    let dest = format!("{}:{}", rule.guest_ip, rule.port);
    let guest_ip = rule.guest_ip.to_string();

    net::run_cmd(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-i",
            &rule.ext_if,
            "-p",
            "udp",
            "--dport",
            &port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
        ],
    )
    .await?;

    net::run_cmd(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-p",
            "udp",
            "-d",
            &guest_ip,
            "--dport",
            &port,
            "-j",
            "MASQUERADE",
        ],
    )
    .await?;

    Ok(())
}

async fn remove_rules(rule: &NatRule) {
    let port = rule.port.to_string();
    let dest = format!("{}:{}", rule.guest_ip, rule.port);
    let guest_ip = rule.guest_ip.to_string();

    net::run_cmd_ignore(
        "iptables",
        &[
            "-t",
            "nat",
            "-D",
            "PREROUTING",
            "-i",
            &rule.ext_if,
            "-p",
            "udp",
            "--dport",
            &port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
        ],
    )
    .await;

    net::run_cmd_ignore(
        "iptables",
        &[
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-p",
            "udp",
            "-d",
            &guest_ip,
            "--dport",
            &port,
            "-j",
            "MASQUERADE",
        ],
    )
    .await;
}

async fn read_nat_rules() -> Result<String> {
    let output = Command::new("sudo")
        .args(["-n", "iptables-save", "-t", "nat"])
        .output()
        .await
        .map_err(|err| Error::Backend(format!("iptables-save failed to run: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Backend(format!(
            "iptables-save failed: {}",
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn rules_installed(saved: &str, port: u16, guest_ip: Ipv4Addr) -> bool {
    let dnat_dest = format!("--to-destination {guest_ip}:{port}");
    let has_dnat = saved.lines().any(|line| {
        line.starts_with("-A PREROUTING") && line.contains("-j DNAT") && line.contains(&dnat_dest)
    });

    let masq_dst = format!("-d {guest_ip}/32");
    let masq_port = format!(" --dport {port} ");
    let has_masq = saved.lines().any(|line| {
        line.starts_with("-A POSTROUTING")
            && line.contains("-j MASQUERADE")
            && line.contains(&masq_dst)
            && line.contains(&masq_port)
    });

    has_dnat && has_masq
}

fn orphan_rule_lines(saved: &str) -> Vec<String> {
    saved
        .lines()
        .filter(|line| {
            (line.starts_with("-A PREROUTING")
                && line.contains("-j DNAT")
                && line.contains("--to-destination 172.16."))
                || (line.starts_with("-A POSTROUTING")
                    && line.contains("-j MASQUERADE")
                    && line.contains("-d 172.16."))
        })
        .map(str::to_string)
        .collect()
}

/// Turn a saved `-A CHAIN ...` line into `-t nat -D CHAIN ...` arguments.
fn delete_args_from_saved_line(line: &str) -> Option<Vec<String>> {
    let rest = line.strip_prefix("-A ")?;
    let mut args: Vec<String> = vec!["-t".into(), "nat".into(), "-D".into()];
    args.extend(rest.split_whitespace().map(str::to_string));
    Some(args)
}
