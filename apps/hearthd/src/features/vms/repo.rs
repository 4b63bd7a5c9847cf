use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tracked VM. This is also the persistence schema: `rootfs_path` and
/// friends are recomputed from the id, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub template: String,
    pub ip: Ipv4Addr,
    pub tap_device: String,
    pub ssh_port: u16,
    pub pid: u32,
    pub socket_path: String,
    pub created_at: DateTime<Utc>,
}

/// Authoritative in-memory VM map, flushed to `state.json` after every
/// committed mutation. Writes go to a sibling temp file first and are
/// renamed into place, so a crash mid-write leaves the previous state
/// intact.
pub struct VmRepository {
    state_path: PathBuf,
    vms: Mutex<HashMap<String, VmRecord>>,
}

impl VmRepository {
    pub fn new(state_path: PathBuf) -> Self {
        Self {
            state_path,
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Read persisted records without installing them; recovery decides
    /// which of them still reflect reality.
    pub async fn load(&self) -> Result<Vec<VmRecord>> {
        let bytes = match tokio::fs::read(&self.state_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("cannot read state file {}", self.state_path.display())
                })
            }
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("cannot parse state file {}", self.state_path.display()))
    }

    pub fn insert(&self, vm: VmRecord) {
        self.vms.lock().unwrap().insert(vm.id.clone(), vm);
    }

    pub fn remove(&self, id: &str) -> Option<VmRecord> {
        self.vms.lock().unwrap().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<VmRecord> {
        self.vms.lock().unwrap().get(id).cloned()
    }

    /// Look a VM up by id first, then by name.
    pub fn find(&self, id_or_name: &str) -> Option<VmRecord> {
        let vms = self.vms.lock().unwrap();
        if let Some(vm) = vms.get(id_or_name) {
            return Some(vm.clone());
        }
        vms.values().find(|vm| vm.name == id_or_name).cloned()
    }

    pub fn list(&self) -> Vec<VmRecord> {
        let mut records: Vec<VmRecord> = self.vms.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.vms.lock().unwrap().len()
    }

    pub fn name_in_use(&self, name: &str) -> bool {
        self.vms.lock().unwrap().values().any(|vm| vm.name == name)
    }

    pub fn tracked_ids(&self) -> HashSet<String> {
        self.vms.lock().unwrap().keys().cloned().collect()
    }

    pub fn tracked_pids(&self) -> HashSet<u32> {
        self.vms.lock().unwrap().values().map(|vm| vm.pid).collect()
    }

    pub fn tap_devices(&self) -> HashSet<String> {
        self.vms
            .lock()
            .unwrap()
            .values()
            .map(|vm| vm.tap_device.clone())
            .collect()
    }

    /// Persist the whole map, sorted by id so repeated saves of the same
    /// state are byte-identical.
    pub async fn save(&self) -> Result<()> {
        let mut records: Vec<VmRecord> = self.vms.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let bytes = serde_json::to_vec_pretty(&records).context("cannot serialize vm state")?;

        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .with_context(|| format!("cannot write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.state_path)
            .await
            .with_context(|| format!("cannot replace {}", self.state_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str, offset: u8) -> VmRecord {
        VmRecord {
            id: id.into(),
            name: name.into(),
            template: "debian-base".into(),
            ip: Ipv4Addr::new(172, 16, 0, offset),
            tap_device: format!("tap-{}", &id[3..]),
            ssh_port: 22000 + u16::from(offset),
            pid: 4000 + u32::from(offset),
            socket_path: format!("/tmp/firecracker-{id}.sock"),
            created_at: "2025-11-02T10:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn find_matches_id_then_name() {
        let repo = VmRepository::new(PathBuf::from("/nonexistent/state.json"));
        repo.insert(record("vm-0011aabbccdd", "gently-amber-otter", 2));

        assert!(repo.find("vm-0011aabbccdd").is_some());
        assert!(repo.find("gently-amber-otter").is_some());
        assert!(repo.find("vm-ffffffffffff").is_none());
        assert!(repo.find("boldly-icy-frog").is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = VmRepository::new(tmp.path().join("state.json"));
        repo.insert(record("vm-0011aabbccdd", "gently-amber-otter", 2));
        repo.insert(record("vm-ffeeddccbba0", "boldly-icy-frog", 3));
        repo.save().await.unwrap();

        let restored = VmRepository::new(tmp.path().join("state.json"));
        let records = restored.load().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|vm| vm.name == "boldly-icy-frog"));
    }

    #[tokio::test]
    async fn repeated_saves_are_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let repo = VmRepository::new(path.clone());
        repo.insert(record("vm-ffeeddccbba0", "boldly-icy-frog", 3));
        repo.insert(record("vm-0011aabbccdd", "gently-amber-otter", 2));

        repo.save().await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();

        // Reload into a fresh map (different iteration order) and save again.
        let reloaded = VmRepository::new(path.clone());
        for vm in reloaded.load().await.unwrap() {
            reloaded.insert(vm);
        }
        reloaded.save().await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn interrupted_write_leaves_previous_state_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let repo = VmRepository::new(path.clone());
        repo.insert(record("vm-0011aabbccdd", "gently-amber-otter", 2));
        repo.save().await.unwrap();

        // A crash between temp-write and rename leaves a half-written
        // sibling behind; the state file itself must stay parseable.
        tokio::fs::write(path.with_extension("json.tmp"), b"[{\"id\": \"vm-tru")
            .await
            .unwrap();
        let records = repo.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "vm-0011aabbccdd");
    }

    #[tokio::test]
    async fn missing_state_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = VmRepository::new(tmp.path().join("state.json"));
        assert!(repo.load().await.unwrap().is_empty());
    }

    #[test]
    fn list_orders_by_creation_time() {
        let repo = VmRepository::new(PathBuf::from("/nonexistent/state.json"));
        let mut older = record("vm-ffeeddccbba0", "boldly-icy-frog", 3);
        older.created_at = "2025-11-01T09:00:00Z".parse().unwrap();
        repo.insert(record("vm-0011aabbccdd", "gently-amber-otter", 2));
        repo.insert(older);

        let listed = repo.list();
        assert_eq!(listed[0].name, "boldly-icy-frog");
        assert_eq!(listed[1].name, "gently-amber-otter");
    }
}
