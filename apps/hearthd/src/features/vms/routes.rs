use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use hearth_types::{CreateVmReq, SnapshotVmReq, SnapshotVmResp, VmView};

use crate::config::Config;
use crate::error::Result;
use crate::AppState;

use super::repo::VmRecord;

pub fn vm_view(cfg: &Config, vm: &VmRecord) -> VmView {
    VmView {
        id: vm.id.clone(),
        name: vm.name.clone(),
        template: vm.template.clone(),
        ip: vm.ip.to_string(),
        ssh_port: vm.ssh_port,
        ssh: format!("ssh -p {} user@{}", vm.ssh_port, cfg.host_ip),
        url: cfg
            .base_domain
            .as_ref()
            .map(|domain| format!("https://{}.{domain}", vm.name)),
        status: "running".into(),
        created_at: vm.created_at,
    }
}

pub async fn create(
    Extension(st): Extension<AppState>,
    Json(req): Json<CreateVmReq>,
) -> Result<(StatusCode, Json<VmView>)> {
    let vm = super::service::create_vm(&st, req).await?;
    Ok((StatusCode::CREATED, Json(vm_view(&st.config, &vm))))
}

pub async fn list(Extension(st): Extension<AppState>) -> Json<Vec<VmView>> {
    let views = st
        .repo
        .list()
        .iter()
        .map(|vm| vm_view(&st.config, vm))
        .collect();
    Json(views)
}

pub async fn get(
    Extension(st): Extension<AppState>,
    Path(id_or_name): Path<String>,
) -> Result<Json<VmView>> {
    let vm = super::service::find_vm(&st, &id_or_name)?;
    Ok(Json(vm_view(&st.config, &vm)))
}

pub async fn delete(
    Extension(st): Extension<AppState>,
    Path(id_or_name): Path<String>,
) -> Result<StatusCode> {
    super::service::delete_vm(&st, &id_or_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn snapshot(
    Extension(st): Extension<AppState>,
    Path(id_or_name): Path<String>,
    Json(req): Json<SnapshotVmReq>,
) -> Result<(StatusCode, Json<SnapshotVmResp>)> {
    let resp = super::service::snapshot_vm(&st, &id_or_name, &req.template_name).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn config(base_domain: Option<&str>) -> Config {
        Config {
            api_token: "token".into(),
            api_port: 8080,
            data_dir: PathBuf::from("/srv/hearth"),
            kernel_path: PathBuf::from("/srv/hearth/kernel/vmlinux"),
            host_ip: "203.0.113.9".into(),
            bridge: "br0".into(),
            port_min: 22001,
            port_max: 32000,
            default_vcpu_count: 2,
            default_mem_size_mib: 2048,
            default_disk_size_gib: 2,
            max_disk_size_gib: 100,
            protected_templates: vec!["debian-base".into()],
            base_domain: base_domain.map(str::to_string),
        }
    }

    fn record() -> VmRecord {
        VmRecord {
            id: "vm-a1b2c3d4e5f6".into(),
            name: "gently-amber-otter".into(),
            template: "debian-base".into(),
            ip: Ipv4Addr::new(172, 16, 0, 2),
            tap_device: "tap-a1b2c3d4e5".into(),
            ssh_port: 22001,
            pid: 4242,
            socket_path: "/tmp/firecracker-vm-a1b2c3d4e5f6.sock".into(),
            created_at: "2025-11-02T10:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn view_derives_ssh_string_and_constant_status() {
        let view = vm_view(&config(None), &record());
        assert_eq!(view.ssh, "ssh -p 22001 user@203.0.113.9");
        assert_eq!(view.status, "running");
        assert_eq!(view.ip, "172.16.0.2");
        assert!(view.url.is_none());
    }

    #[test]
    fn view_url_present_only_with_base_domain() {
        let view = vm_view(&config(Some("vms.example.com")), &record());
        assert_eq!(
            view.url.as_deref(),
            Some("https://gently-amber-otter.vms.example.com")
        );
    }
}
