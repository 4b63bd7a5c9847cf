use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{BRIDGE_ADDR, BRIDGE_NETMASK};
use crate::error::{Error, Result};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOCKET_POLL_ATTEMPTS: u32 = 50;
const POST_START_GRACE: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_millis(500);

pub struct LaunchConfig {
    pub vm_id: String,
    pub socket_path: String,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub boot_args: String,
    pub tap_device: String,
    pub guest_mac: String,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub console_log_path: String,
}

/// Kernel command line for a statically configured guest on the bridge.
pub fn boot_args(guest_ip: Ipv4Addr) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={guest_ip}::{BRIDGE_ADDR}:{BRIDGE_NETMASK}::eth0:off"
    )
}

/// Spawn and configure one Firecracker process; returns its PID.
///
/// The child outlives this handle: it is moved into a background reaper so
/// a daemon restart never takes guests down with it. Failures after spawn
/// kill the child before returning; the caller compensates everything it
/// allocated earlier.
pub async fn start(cfg: &LaunchConfig) -> Result<u32> {
    if Path::new(&cfg.socket_path).exists() {
        tokio::fs::remove_file(&cfg.socket_path).await?;
    }

    let mut child = Command::new("firecracker")
        .arg("--api-sock")
        .arg(&cfg.socket_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|err| Error::Backend(format!("failed to spawn firecracker: {err}")))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Backend("firecracker exited before reporting a pid".into()))?;

    pump_console(&mut child, &cfg.console_log_path).await;

    // Reap the child when it eventually exits, without tying its lifetime
    // to ours.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    if let Err(err) = configure_and_boot(cfg).await {
        stop(pid).await;
        return Err(err);
    }

    tokio::time::sleep(POST_START_GRACE).await;
    if !probe_pid(pid) {
        return Err(Error::Backend(format!(
            "firecracker for {} died right after start",
            cfg.vm_id
        )));
    }

    info!(vm_id = %cfg.vm_id, pid, "firecracker running");
    Ok(pid)
}

async fn configure_and_boot(cfg: &LaunchConfig) -> Result<()> {
    wait_for_socket(&cfg.socket_path).await?;

    request(
        &cfg.socket_path,
        Method::PUT,
        "/boot-source",
        Some(serde_json::json!({
            "kernel_image_path": cfg.kernel_path,
            "boot_args": cfg.boot_args,
        })),
    )
    .await?;

    request(
        &cfg.socket_path,
        Method::PUT,
        "/drives/rootfs",
        Some(serde_json::json!({
            "drive_id": "rootfs",
            "path_on_host": cfg.rootfs_path,
            "is_root_device": true,
            "is_read_only": false,
        })),
    )
    .await?;

    request(
        &cfg.socket_path,
        Method::PUT,
        "/network-interfaces/eth0",
        Some(serde_json::json!({
            "iface_id": "eth0",
            "guest_mac": cfg.guest_mac,
            "host_dev_name": cfg.tap_device,
        })),
    )
    .await?;

    request(
        &cfg.socket_path,
        Method::PUT,
        "/machine-config",
        Some(serde_json::json!({
            "vcpu_count": cfg.vcpu_count,
            "mem_size_mib": cfg.mem_size_mib,
            "smt": false,
        })),
    )
    .await?;

    request(
        &cfg.socket_path,
        Method::PUT,
        "/actions",
        Some(serde_json::json!({ "action_type": "InstanceStart" })),
    )
    .await?;

    Ok(())
}

/// Terminate a hypervisor by PID: SIGTERM, a short grace, then SIGKILL.
/// All signal errors are swallowed; a dead process is the goal.
pub async fn stop(pid: u32) {
    signal(pid, libc::SIGTERM);
    tokio::time::sleep(STOP_GRACE).await;
    signal(pid, libc::SIGKILL);
}

pub async fn pause(socket_path: &str) -> Result<()> {
    request(
        socket_path,
        Method::PATCH,
        "/vm",
        Some(serde_json::json!({ "state": "Paused" })),
    )
    .await
}

pub async fn resume(socket_path: &str) -> Result<()> {
    request(
        socket_path,
        Method::PATCH,
        "/vm",
        Some(serde_json::json!({ "state": "Resumed" })),
    )
    .await
}

/// Liveness probe by signal 0.
pub fn probe_pid(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

/// Wire the child's stdout/stderr into the console log. Best-effort: a
/// failed pump loses console output, never the VM.
async fn pump_console(child: &mut tokio::process::Child, log_path: &str) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    match tokio::fs::File::create(log_path).await {
        Ok(mut log) => {
            if let Some(mut out) = stdout {
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut out, &mut log).await;
                });
            }
        }
        Err(err) => debug!("could not create console log {log_path}: {err}"),
    }

    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
    {
        Ok(mut log) => {
            if let Some(mut errs) = stderr {
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut errs, &mut log).await;
                });
            }
        }
        Err(err) => debug!("could not open console log {log_path}: {err}"),
    }
}

async fn wait_for_socket(socket_path: &str) -> Result<()> {
    for _ in 0..SOCKET_POLL_ATTEMPTS {
        if Path::new(socket_path).exists() {
            return Ok(());
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
    Err(Error::Unavailable(format!(
        "firecracker api socket {socket_path} did not appear within 5s"
    )))
}

/// One HTTP request to the Firecracker API over its Unix socket. Any
/// non-2xx status or a `fault_message` in the body is fatal.
async fn request(
    socket_path: &str,
    method: Method,
    path: &str,
    body: Option<serde_json::Value>,
) -> Result<()> {
    let client: Client<UnixConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(UnixConnector);
    let uri = hyperlocal::Uri::new(socket_path, path);

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Accept", "application/json");
    let req = match body {
        Some(value) => {
            builder = builder.header("Content-Type", "application/json");
            let payload = serde_json::to_vec(&value)
                .map_err(|err| Error::Backend(format!("cannot encode {path} payload: {err}")))?;
            builder.body(Full::new(Bytes::from(payload)))
        }
        None => builder.body(Full::new(Bytes::new())),
    }
    .map_err(|err| Error::Backend(format!("cannot build {path} request: {err}")))?;

    let response = client
        .request(req)
        .await
        .map_err(|err| Error::Backend(format!("firecracker api {path} unreachable: {err}")))?;

    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|err| Error::Backend(format!("firecracker api {path} read failed: {err}")))?
        .to_bytes();
    let text = String::from_utf8_lossy(&bytes);

    if let Some(fault) = fault_message(&text) {
        return Err(Error::Backend(format!(
            "firecracker fault on {path}: {fault}"
        )));
    }
    if !status.is_success() {
        warn!(%status, path, body = %text.trim(), "firecracker api call failed");
        return Err(Error::Backend(format!(
            "firecracker api {path} returned {status}"
        )));
    }
    Ok(())
}

fn fault_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("fault_message")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_args_pin_static_guest_network() {
        let args = boot_args(Ipv4Addr::new(172, 16, 0, 7));
        assert_eq!(
            args,
            "console=ttyS0 reboot=k panic=1 pci=off ip=172.16.0.7::172.16.0.1:255.255.0.0::eth0:off"
        );
    }

    #[test]
    fn fault_message_extracted_from_body() {
        assert_eq!(
            fault_message(r#"{"fault_message":"no kvm"}"#),
            Some("no kvm".to_string())
        );
        assert_eq!(fault_message(r#"{"ok":true}"#), None);
        assert_eq!(fault_message("not json"), None);
        assert_eq!(fault_message(""), None);
    }

    #[test]
    fn probe_detects_own_process_and_rejects_bogus_pid() {
        assert!(probe_pid(std::process::id()));
        // Max pid on Linux is bounded well below this.
        assert!(!probe_pid(0x3fff_fff0));
    }
}
