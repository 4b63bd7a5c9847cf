use anyhow::{anyhow, bail, Result};
use tokio::process::Command;

/// Create a TAP device and enslave it to the bridge.
pub async fn create_tap(name: &str, bridge: &str) -> Result<()> {
    // A stale device with the same name blocks tuntap add; clear it first.
    let check = Command::new("ip")
        .args(["link", "show", name])
        .output()
        .await?;
    if check.status.success() {
        let _ = Command::new("sudo")
            .args(["-n", "ip", "link", "del", name])
            .status()
            .await?;
    }

    run_cmd("ip", &["tuntap", "add", "dev", name, "mode", "tap"]).await?;
    run_cmd("ip", &["link", "set", name, "master", bridge]).await?;
    run_cmd("ip", &["link", "set", name, "up"]).await?;
    Ok(())
}

pub async fn delete_tap(name: &str) -> Result<()> {
    let output = Command::new("sudo")
        .args(["-n", "ip", "link", "del", name])
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr_trimmed = stderr.trim();

    if stderr_trimmed.contains("Cannot find device")
        || stderr_trimmed.contains("does not exist")
        || stderr_trimmed.is_empty()
    {
        return Ok(());
    }

    Err(anyhow!("failed to delete tap {name}: {stderr_trimmed}"))
}

/// List kernel interface names via `ip -o link show`.
pub async fn list_links() -> Result<Vec<String>> {
    let output = Command::new("ip")
        .args(["-o", "link", "show"])
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_links(&stdout))
}

pub fn parse_links(output: &str) -> Vec<String> {
    let mut names: Vec<String> = output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut parts = line.splitn(3, ':');
            parts.next()?; // index
            let name = parts.next()?.trim();
            let name = name.split('@').next()?.trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Interface carrying the host's default route.
pub async fn detect_default_interface() -> Result<String> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Parse: "default via 10.0.0.1 dev eth0 ..."
    let iface = stdout
        .split_whitespace()
        .skip_while(|w| *w != "dev")
        .nth(1)
        .ok_or_else(|| anyhow!("could not detect default network interface"))?
        .to_string();
    Ok(iface)
}

pub async fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    let mut full_args = vec!["-n", cmd];
    full_args.extend_from_slice(args);
    let output = Command::new("sudo").args(&full_args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "command `sudo {} {}` failed: {}",
            cmd,
            args.join(" "),
            stderr.trim()
        );
    }
    Ok(())
}

pub async fn run_cmd_ignore(cmd: &str, args: &[&str]) {
    let mut full_args = vec!["-n", cmd];
    full_args.extend_from_slice(args);
    let _ = Command::new("sudo").args(&full_args).output().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_names_from_ip_output() {
        let output = r#"
1: lo: <LOOPBACK> mtu 65536 qdisc noop state DOWN mode DEFAULT group default qlen 1000
2: tap-4f3a9b21cd: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000
3: tap-77aa00bb11@br0: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT group default qlen 1000
4: eth0@if5: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT group default qlen 1000
"#;
        let links = parse_links(output);
        assert_eq!(
            links,
            vec!["eth0", "lo", "tap-4f3a9b21cd", "tap-77aa00bb11"]
        );
    }

    #[test]
    fn default_interface_parse_shape() {
        let stdout = "default via 10.0.0.1 dev eth0 proto dhcp metric 100";
        let iface = stdout
            .split_whitespace()
            .skip_while(|w| *w != "dev")
            .nth(1)
            .unwrap();
        assert_eq!(iface, "eth0");
    }
}
