use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::config::Config;
use crate::core::net;
use crate::error::{Error, Result};

/// Free space kept in reserve beyond any requested allocation.
const SPACE_BUFFER_GIB: u64 = 2;

/// On-disk image pipeline: templates are cloned to per-VM rootfs files via
/// reflink, mutated through loop mounts, and cloned back into templates by
/// snapshots.
pub struct Storage {
    cfg: Arc<Config>,
}

pub fn validate_template_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "template name {name:?} must match [A-Za-z0-9_-]+"
        )))
    }
}

impl Storage {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self { cfg }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.cfg.templates_dir()).await?;
        tokio::fs::create_dir_all(self.cfg.vms_dir()).await?;
        Ok(())
    }

    pub fn free_bytes(&self) -> anyhow::Result<u64> {
        let path = CString::new(self.cfg.data_dir.as_os_str().as_bytes())?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
        if rc != 0 {
            bail!(
                "statvfs({}) failed: {}",
                self.cfg.data_dir.display(),
                std::io::Error::last_os_error()
            );
        }
        Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
    }

    pub fn check_available_space(&self, need_gib: u64) -> Result<()> {
        let free = self.free_bytes().map_err(Error::Internal)?;
        let need = (need_gib + SPACE_BUFFER_GIB).saturating_mul(1 << 30);
        if free < need {
            return Err(Error::ExhaustedStorage(format!(
                "need {need_gib} GiB plus {SPACE_BUFFER_GIB} GiB buffer, only {free} bytes free"
            )));
        }
        Ok(())
    }

    /// Clone a template image into a fresh per-VM rootfs.
    pub async fn copy_rootfs(&self, template: &str, vm_id: &str, size_gib: u64) -> Result<PathBuf> {
        let src = self.cfg.template_image_path(template);
        if tokio::fs::metadata(&src).await.is_err() {
            return Err(Error::NotFound(format!("template {template} not found")));
        }
        self.check_available_space(size_gib)?;

        let dst = self.cfg.rootfs_path(vm_id);
        reflink_copy(&src, &dst).await.map_err(Error::Internal)?;
        Ok(dst)
    }

    /// Clone a (paused) VM rootfs back into a new template image.
    pub async fn copy_rootfs_to_template(&self, rootfs: &Path, name: &str) -> Result<PathBuf> {
        validate_template_name(name)?;
        let dst = self.cfg.template_image_path(name);
        if tokio::fs::metadata(&dst).await.is_ok() {
            return Err(Error::Conflict(format!("template {name} already exists")));
        }
        reflink_copy(rootfs, &dst).await.map_err(Error::Internal)?;
        tokio::fs::write(self.cfg.template_version_path(name), b"1\n")
            .await
            .map_err(|err| Error::Internal(err.into()))?;
        Ok(dst)
    }

    /// Grow the sparse image file, then the ext4 filesystem inside it.
    pub async fn resize_rootfs(&self, rootfs: &Path, size_gib: u64) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(rootfs)
            .await?;
        file.set_len(size_gib << 30).await?;

        let path = path_str(rootfs)?;
        // e2fsck exits 1/2 after repairing; only real failures abort.
        let output = Command::new("sudo")
            .args(["-n", "e2fsck", "-fy", &path])
            .output()
            .await?;
        if !matches!(output.status.code(), Some(0..=2)) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Internal(anyhow::anyhow!(
                "e2fsck on {path} failed: {}",
                stderr.trim()
            )));
        }
        net::run_cmd("resize2fs", &[&path])
            .await
            .map_err(Error::Internal)?;
        Ok(())
    }

    /// Write the SSH public key into the image before first boot.
    pub async fn inject_ssh_key(&self, rootfs: &Path, public_key: &str) -> Result<()> {
        let mnt = mount_point_for(rootfs);
        mount_image(rootfs, &mnt).await.map_err(Error::Internal)?;

        let result = async {
            let ssh_dir = path_str(&mnt.join("home/user/.ssh"))?;
            let keys_file = path_str(&mnt.join("home/user/.ssh/authorized_keys"))?;
            net::run_cmd("mkdir", &["-p", &ssh_dir])
                .await
                .map_err(Error::Internal)?;
            write_root_file(&keys_file, &format!("{}\n", public_key.trim()))
                .await
                .map_err(Error::Internal)?;
            net::run_cmd("chmod", &["700", &ssh_dir])
                .await
                .map_err(Error::Internal)?;
            net::run_cmd("chmod", &["600", &keys_file])
                .await
                .map_err(Error::Internal)?;
            net::run_cmd("chown", &["-R", "user:user", &ssh_dir])
                .await
                .map_err(Error::Internal)?;
            Ok(())
        }
        .await;

        unmount_image(&mnt).await;
        result
    }

    /// Empty both authorized_keys files so a snapshot does not ship the
    /// creator's key. Either file may be absent.
    pub async fn clear_authorized_keys(&self, image: &Path) -> Result<()> {
        let mnt = mount_point_for(image);
        mount_image(image, &mnt).await.map_err(Error::Internal)?;

        let result = async {
            for rel in ["home/user/.ssh/authorized_keys", "root/.ssh/authorized_keys"] {
                let target = mnt.join(rel);
                if tokio::fs::metadata(&target).await.is_err() {
                    continue;
                }
                let target = path_str(&target)?;
                net::run_cmd("truncate", &["-s", "0", &target])
                    .await
                    .map_err(Error::Internal)?;
            }
            Ok(())
        }
        .await;

        unmount_image(&mnt).await;
        result
    }

    /// Best-effort unlink; idempotent.
    pub async fn delete_rootfs(&self, rootfs: &Path) {
        if let Err(err) = tokio::fs::remove_file(rootfs).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not delete rootfs {}: {err}", rootfs.display());
            }
        }
    }
}

async fn reflink_copy(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let output = Command::new("cp")
        .arg("--reflink=auto")
        .arg(src)
        .arg(dst)
        .output()
        .await
        .context("failed to run cp")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "reflink copy {} -> {} failed: {}",
            src.display(),
            dst.display(),
            stderr.trim()
        );
    }
    Ok(())
}

fn mount_point_for(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    PathBuf::from(format!("/tmp/hearth-mnt-{stem}"))
}

async fn mount_image(image: &Path, mnt: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(mnt).await?;
    let image = path_str_any(image)?;
    let mnt = path_str_any(mnt)?;
    net::run_cmd("mount", &["-o", "loop", &image, &mnt]).await
}

/// Unmount failure is logged and ignored; nothing else has the image open.
async fn unmount_image(mnt: &Path) {
    match path_str_any(mnt) {
        Ok(path) => {
            if let Err(err) = net::run_cmd("umount", &[&path]).await {
                warn!("could not unmount {path}: {err}");
            }
        }
        Err(err) => warn!("bad mount point path: {err}"),
    }
    let _ = tokio::fs::remove_dir(mnt).await;
}

async fn write_root_file(path: &str, content: &str) -> anyhow::Result<()> {
    let mut child = Command::new("sudo")
        .args(["-n", "tee", path])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .spawn()
        .context("failed to spawn tee")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(content.as_bytes()).await?;
    }
    let status = child.wait().await?;
    if !status.success() {
        bail!("writing {path} failed");
    }
    Ok(())
}

fn path_str(path: &Path) -> Result<String> {
    path_str_any(path).map_err(Error::Internal)
}

fn path_str_any(path: &Path) -> anyhow::Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("path {} is not valid utf-8", path.display()))
}
