use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::Utc;
use hearth_types::{CreateVmReq, SnapshotVmResp};
use tracing::{info, warn};

use crate::core::{firecracker, net};
use crate::error::{Error, Result};
use crate::features::storage;
use crate::AppState;

use super::alloc;
use super::names;
use super::repo::VmRecord;

/// Guest-side SSH port every TCP forwarder targets.
pub const GUEST_SSH_PORT: u16 = 22;

struct CreatePlan {
    id: String,
    name: String,
    template: String,
    ssh_public_key: String,
    vcpu_count: u8,
    mem_size_mib: u32,
    disk_gib: u64,
}

/// Resources acquired so far by a create pipeline. On failure they are
/// walked back in reverse acquisition order, each undo best-effort, and
/// the triggering error is rethrown untouched.
#[derive(Default)]
struct Undo {
    vm_id: String,
    ip: Option<Ipv4Addr>,
    port: Option<u16>,
    rootfs: Option<PathBuf>,
    tap: Option<String>,
    pid: Option<u32>,
    tcp: bool,
    udp: bool,
    inserted: bool,
}

impl Undo {
    fn new(vm_id: &str) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            ..Default::default()
        }
    }

    async fn run(self, st: &AppState) {
        if self.udp {
            st.nat.stop(&self.vm_id).await;
        }
        if self.tcp {
            st.forwarders.stop(&self.vm_id);
        }
        if let Some(pid) = self.pid {
            firecracker::stop(pid).await;
            let _ = tokio::fs::remove_file(alloc::socket_path_for(&self.vm_id)).await;
        }
        if let Some(tap) = &self.tap {
            if let Err(err) = net::delete_tap(tap).await {
                warn!(vm_id = %self.vm_id, "cleanup: could not delete tap {tap}: {err}");
            }
        }
        if let Some(rootfs) = &self.rootfs {
            st.storage.delete_rootfs(rootfs).await;
        }
        if let Some(port) = self.port {
            st.alloc.ports.lock().unwrap().release(port);
        }
        if let Some(ip) = self.ip {
            st.alloc.ips.lock().unwrap().release(ip);
        }
        if self.inserted {
            st.repo.remove(&self.vm_id);
        }
    }
}

pub fn find_vm(st: &AppState, id_or_name: &str) -> Result<VmRecord> {
    st.repo
        .find(id_or_name)
        .ok_or_else(|| Error::NotFound(format!("vm {id_or_name} not found")))
}

pub async fn create_vm(st: &AppState, req: CreateVmReq) -> Result<VmRecord> {
    let _guard = st.create_lock.lock().await;
    let cfg = &st.config;

    storage::validate_template_name(&req.template)?;
    let disk_gib = u64::from(req.disk_size_gib.unwrap_or(cfg.default_disk_size_gib));
    if disk_gib < 1 || disk_gib > u64::from(cfg.max_disk_size_gib) {
        return Err(Error::InvalidArgument(format!(
            "disk_size_gib must be within 1..={}",
            cfg.max_disk_size_gib
        )));
    }
    if req.ssh_public_key.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "ssh_public_key must not be empty".into(),
        ));
    }

    let name = match &req.name {
        Some(name) => {
            if st.repo.name_in_use(name) {
                return Err(Error::InvalidArgument(format!(
                    "name {name} is already in use"
                )));
            }
            name.clone()
        }
        None => names::generate(|candidate| st.repo.name_in_use(candidate)),
    };

    let plan = CreatePlan {
        id: alloc::mint_vm_id(),
        name,
        template: req.template.clone(),
        ssh_public_key: req.ssh_public_key.clone(),
        vcpu_count: req.vcpu_count.unwrap_or(cfg.default_vcpu_count),
        mem_size_mib: req.mem_size_mib.unwrap_or(cfg.default_mem_size_mib),
        disk_gib,
    };

    let mut undo = Undo::new(&plan.id);
    match provision(st, &plan, &mut undo).await {
        Ok(vm) => {
            metrics::counter!("hearthd_vm_create_success", 1);
            info!(vm_id = %vm.id, name = %vm.name, ip = %vm.ip, ssh_port = vm.ssh_port, "vm created");
            Ok(vm)
        }
        Err(err) => {
            metrics::counter!("hearthd_vm_create_failure", 1);
            warn!(vm_id = %plan.id, error = %err, "vm creation failed, compensating");
            undo.run(st).await;
            Err(err)
        }
    }
}

async fn provision(st: &AppState, plan: &CreatePlan, undo: &mut Undo) -> Result<VmRecord> {
    let cfg = &st.config;
    let tap_device = alloc::tap_device_for(&plan.id);
    let socket_path = alloc::socket_path_for(&plan.id);
    let guest_mac = alloc::mac_for(&plan.id);

    let ip = st.alloc.ips.lock().unwrap().allocate()?;
    undo.ip = Some(ip);
    let port = st.alloc.ports.lock().unwrap().allocate()?;
    undo.port = Some(port);

    st.storage.check_available_space(plan.disk_gib)?;
    let rootfs = st
        .storage
        .copy_rootfs(&plan.template, &plan.id, plan.disk_gib)
        .await?;
    undo.rootfs = Some(rootfs.clone());

    if plan.disk_gib > u64::from(cfg.default_disk_size_gib) {
        st.storage.resize_rootfs(&rootfs, plan.disk_gib).await?;
    }
    st.storage
        .inject_ssh_key(&rootfs, &plan.ssh_public_key)
        .await?;

    net::create_tap(&tap_device, &cfg.bridge)
        .await
        .map_err(Error::Internal)?;
    undo.tap = Some(tap_device.clone());

    let launch = firecracker::LaunchConfig {
        vm_id: plan.id.clone(),
        socket_path: socket_path.clone(),
        kernel_path: cfg.kernel_path.clone(),
        rootfs_path: rootfs,
        boot_args: firecracker::boot_args(ip),
        tap_device: tap_device.clone(),
        guest_mac,
        vcpu_count: plan.vcpu_count,
        mem_size_mib: plan.mem_size_mib,
        console_log_path: alloc::console_log_path_for(&plan.id),
    };
    let pid = firecracker::start(&launch).await?;
    undo.pid = Some(pid);

    st.forwarders
        .start(&plan.id, port, ip, GUEST_SSH_PORT)
        .await?;
    undo.tcp = true;
    // mosh uses a single port for both ends, hence port == port.
    st.nat.start(&plan.id, port, ip, port).await?;
    undo.udp = true;

    let vm = VmRecord {
        id: plan.id.clone(),
        name: plan.name.clone(),
        template: plan.template.clone(),
        ip,
        tap_device,
        ssh_port: port,
        pid,
        socket_path,
        created_at: Utc::now(),
    };
    st.repo.insert(vm.clone());
    undo.inserted = true;
    st.repo.save().await.map_err(Error::Internal)?;
    Ok(vm)
}

/// Tear a VM down. Every step is idempotent, so a partially failed delete
/// can simply be retried.
pub async fn delete_vm(st: &AppState, id_or_name: &str) -> Result<()> {
    let _guard = st.create_lock.lock().await;
    let vm = find_vm(st, id_or_name)?;

    st.nat.stop(&vm.id).await;
    st.forwarders.stop(&vm.id);
    firecracker::stop(vm.pid).await;
    let _ = tokio::fs::remove_file(&vm.socket_path).await;
    if let Err(err) = net::delete_tap(&vm.tap_device).await {
        warn!(vm_id = %vm.id, "could not delete tap {}: {err}", vm.tap_device);
    }
    st.storage
        .delete_rootfs(&st.config.rootfs_path(&vm.id))
        .await;
    st.alloc.ports.lock().unwrap().release(vm.ssh_port);
    st.alloc.ips.lock().unwrap().release(vm.ip);
    st.repo.remove(&vm.id);
    st.repo.save().await.map_err(Error::Internal)?;

    metrics::counter!("hearthd_vm_delete", 1);
    info!(vm_id = %vm.id, name = %vm.name, "vm deleted");
    Ok(())
}

/// Freeze the guest, reflink its rootfs into a new template, resume.
/// Resume is attempted no matter how the clone went; its failure is logged
/// but never masks the clone error.
pub async fn snapshot_vm(
    st: &AppState,
    id_or_name: &str,
    template_name: &str,
) -> Result<SnapshotVmResp> {
    let _guard = st.create_lock.lock().await;
    let vm = find_vm(st, id_or_name)?;

    storage::validate_template_name(template_name)?;
    if tokio::fs::metadata(st.config.template_image_path(template_name))
        .await
        .is_ok()
    {
        return Err(Error::Conflict(format!(
            "template {template_name} already exists"
        )));
    }

    let rootfs = st.config.rootfs_path(&vm.id);
    let cloned = async {
        firecracker::pause(&vm.socket_path).await?;
        st.storage
            .copy_rootfs_to_template(&rootfs, template_name)
            .await
    }
    .await;

    if let Err(err) = firecracker::resume(&vm.socket_path).await {
        warn!(vm_id = %vm.id, "could not resume vm after snapshot: {err}");
    }

    let template_path = cloned?;
    st.storage.clear_authorized_keys(&template_path).await?;

    let size_bytes = tokio::fs::metadata(&template_path).await?.len();
    metrics::counter!("hearthd_vm_snapshot", 1);
    info!(vm_id = %vm.id, template = template_name, size_bytes, "snapshot created");

    Ok(SnapshotVmResp {
        template: template_name.to_string(),
        source_vm: vm.id,
        size_bytes,
        created_at: Utc::now(),
    })
}
