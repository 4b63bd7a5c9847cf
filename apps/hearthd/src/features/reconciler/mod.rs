use tokio::process::Command;
use tracing::{info, warn};

use crate::core::{firecracker, net};
use crate::features::vms::alloc;
use crate::features::vms::service::GUEST_SSH_PORT;
use crate::AppState;

/// Startup pass, run before the HTTP listener binds: scrub stale NAT
/// rules, re-attach to hypervisors that survived the daemon, then reap
/// every untracked remnant (process, tap, rootfs).
pub async fn run(st: &AppState) -> anyhow::Result<()> {
    let scrubbed = st.nat.cleanup_orphans().await;
    let (recovered, stale) = recover_tracked(st).await?;
    let (procs, taps, images) = sweep_orphans(st).await?;

    metrics::counter!("hearthd_reconcile_orphans_removed", (procs + taps + images) as u64);
    info!(
        "[reconcile] startup pass complete: {recovered} vms recovered, {stale} stale records dropped, \
         {scrubbed} nat rules scrubbed, {procs} orphan processes killed, {taps} taps deleted, \
         {images} rootfs files removed"
    );
    if scrubbed + stale + procs + taps + images == 0 {
        info!("[reconcile] host state matches repository, nothing to clean");
    }
    Ok(())
}

/// Restore VMs whose hypervisor still runs; drop the rest and reap their
/// leftovers by derived name.
async fn recover_tracked(st: &AppState) -> anyhow::Result<(usize, usize)> {
    let records = st.repo.load().await?;
    let mut recovered = 0;
    let mut stale = 0;

    for vm in records {
        if firecracker::probe_pid(vm.pid) {
            st.alloc.ips.lock().unwrap().reserve(vm.ip);
            st.alloc.ports.lock().unwrap().reserve(vm.ssh_port);

            if let Err(err) = st
                .forwarders
                .start(&vm.id, vm.ssh_port, vm.ip, GUEST_SSH_PORT)
                .await
            {
                warn!("[reconcile] tcp forwarder for {} failed: {err}", vm.id);
            }
            if let Err(err) = st.nat.start(&vm.id, vm.ssh_port, vm.ip, vm.ssh_port).await {
                warn!("[reconcile] udp rules for {} failed: {err}", vm.id);
            }

            info!("[reconcile] recovered vm {} (pid {})", vm.id, vm.pid);
            st.repo.insert(vm);
            recovered += 1;
        } else {
            info!(
                "[reconcile] vm {} (pid {}) no longer running, dropping record",
                vm.id, vm.pid
            );
            if let Err(err) = net::delete_tap(&alloc::tap_device_for(&vm.id)).await {
                warn!("[reconcile] could not delete tap for {}: {err}", vm.id);
            }
            st.storage
                .delete_rootfs(&st.config.rootfs_path(&vm.id))
                .await;
            let _ = tokio::fs::remove_file(&vm.socket_path).await;
            stale += 1;
        }
    }

    st.repo.save().await?;
    Ok((recovered, stale))
}

async fn sweep_orphans(st: &AppState) -> anyhow::Result<(usize, usize, usize)> {
    let tracked_pids = st.repo.tracked_pids();
    let tracked_ids = st.repo.tracked_ids();
    let tracked_taps = st.repo.tap_devices();

    let mut procs = 0;
    match Command::new("ps").args(["-eo", "pid=,args="]).output().await {
        Ok(output) => {
            let listing = String::from_utf8_lossy(&output.stdout);
            for (pid, vm_id) in parse_firecracker_processes(&listing) {
                if tracked_pids.contains(&pid) {
                    continue;
                }
                info!("[reconcile] killing orphan firecracker pid {pid} ({vm_id})");
                firecracker::stop(pid).await;
                let _ = tokio::fs::remove_file(alloc::socket_path_for(&vm_id)).await;
                procs += 1;
            }
        }
        Err(err) => warn!("[reconcile] could not list processes: {err}"),
    }

    let mut taps = 0;
    match net::list_links().await {
        Ok(links) => {
            for link in links {
                if !link.starts_with("tap-") || tracked_taps.contains(&link) {
                    continue;
                }
                info!("[reconcile] deleting orphan tap {link}");
                match net::delete_tap(&link).await {
                    Ok(()) => taps += 1,
                    Err(err) => warn!("[reconcile] could not delete tap {link}: {err}"),
                }
            }
        }
        Err(err) => warn!("[reconcile] could not list links: {err}"),
    }

    let mut images = 0;
    match tokio::fs::read_dir(st.config.vms_dir()).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name();
                let Some(vm_id) = rootfs_vm_id(&file_name.to_string_lossy()) else {
                    continue;
                };
                if tracked_ids.contains(&vm_id) {
                    continue;
                }
                info!(
                    "[reconcile] removing orphan rootfs {}",
                    entry.path().display()
                );
                let _ = tokio::fs::remove_file(entry.path()).await;
                images += 1;
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("[reconcile] could not scan vm images: {err}"),
    }

    Ok((procs, taps, images))
}

/// Match `ps -eo pid=,args=` lines whose command carries a hearth control
/// socket; yields (pid, vm id).
fn parse_firecracker_processes(listing: &str) -> Vec<(u32, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().split_whitespace();
            let pid: u32 = parts.next()?.parse().ok()?;
            parts
                .find_map(socket_vm_id)
                .map(|vm_id| (pid, vm_id))
        })
        .collect()
}

fn socket_vm_id(token: &str) -> Option<String> {
    let name = token
        .strip_prefix("/tmp/firecracker-")?
        .strip_suffix(".sock")?;
    alloc::is_vm_id(name).then(|| name.to_string())
}

fn rootfs_vm_id(file_name: &str) -> Option<String> {
    let id = file_name.strip_suffix(".ext4")?;
    alloc::is_vm_id(id).then(|| id.to_string())
}
