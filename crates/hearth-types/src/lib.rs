use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmReq {
    pub template: String,
    pub ssh_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu_count: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_size_mib: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gib: Option<u32>,
}

/// View model returned for every VM read and create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmView {
    pub id: String,
    pub name: String,
    pub template: String,
    pub ip: String,
    pub ssh_port: u16,
    pub ssh: String,
    pub url: Option<String>,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotVmReq {
    pub template_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotVmResp {
    pub template: String,
    pub source_vm: String,
    pub size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub version: u64,
    pub size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTemplatesResp {
    pub templates: Vec<TemplateInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStats {
    pub cpu_count: usize,
    pub mem_total_mib: u64,
    pub mem_available_mib: u64,
    pub data_dir_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResp {
    pub vm_count: usize,
    pub template_count: usize,
    pub host: HostStats,
}
