use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Gateway address of the host bridge; guests route through it.
pub const BRIDGE_ADDR: &str = "172.16.0.1";
pub const BRIDGE_NETMASK: &str = "255.255.0.0";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_token: String,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub host_ip: String,
    pub bridge: String,
    pub port_min: u16,
    pub port_max: u16,
    pub default_vcpu_count: u8,
    pub default_mem_size_mib: u32,
    pub default_disk_size_gib: u32,
    pub max_disk_size_gib: u32,
    pub protected_templates: Vec<String>,
    pub base_domain: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            match get(key) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => bail!("required environment variable {key} is not set"),
            }
        };

        let port_min = parse_or(&get, "PORT_MIN", 22001)?;
        let port_max = parse_or(&get, "PORT_MAX", 32000)?;
        if port_min > port_max {
            bail!("PORT_MIN ({port_min}) must not exceed PORT_MAX ({port_max})");
        }

        let protected_templates = get("PROTECTED_TEMPLATES")
            .map(|raw| {
                raw.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["debian-base".to_string()]);

        Ok(Self {
            api_token: required("API_TOKEN")?,
            api_port: parse_or(&get, "API_PORT", 8080)?,
            data_dir: PathBuf::from(required("DATA_DIR")?),
            kernel_path: PathBuf::from(required("KERNEL_PATH")?),
            host_ip: required("HOST_IP")?,
            bridge: get("BRIDGE").unwrap_or_else(|| "br0".into()),
            port_min,
            port_max,
            default_vcpu_count: parse_or(&get, "DEFAULT_VCPU_COUNT", 2)?,
            default_mem_size_mib: parse_or(&get, "DEFAULT_MEM_SIZE_MIB", 2048)?,
            default_disk_size_gib: parse_or(&get, "DEFAULT_DISK_SIZE_GIB", 2)?,
            max_disk_size_gib: parse_or(&get, "MAX_DISK_SIZE_GIB", 100)?,
            protected_templates,
            base_domain: get("BASE_DOMAIN").filter(|d| !d.trim().is_empty()),
        })
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.data_dir.join("templates")
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.data_dir.join("vms")
    }

    pub fn state_path(&self) -> PathBuf {
        self.vms_dir().join("state.json")
    }

    pub fn rootfs_path(&self, vm_id: &str) -> PathBuf {
        self.vms_dir().join(format!("{vm_id}.ext4"))
    }

    pub fn template_image_path(&self, name: &str) -> PathBuf {
        self.templates_dir().join(format!("{name}.ext4"))
    }

    pub fn template_version_path(&self, name: &str) -> PathBuf {
        self.templates_dir().join(format!("{name}.version"))
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("API_TOKEN", "secret"),
            ("DATA_DIR", "/srv/hearth"),
            ("KERNEL_PATH", "/srv/hearth/kernel/vmlinux"),
            ("HOST_IP", "203.0.113.9"),
        ])
    }

    fn config_from(env: &HashMap<&str, &str>) -> Result<Config> {
        Config::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_applied_for_optional_vars() {
        let cfg = config_from(&base_env()).unwrap();
        assert_eq!(cfg.api_port, 8080);
        assert_eq!(cfg.port_min, 22001);
        assert_eq!(cfg.port_max, 32000);
        assert_eq!(cfg.default_disk_size_gib, 2);
        assert_eq!(cfg.protected_templates, vec!["debian-base".to_string()]);
        assert!(cfg.base_domain.is_none());
    }

    #[test]
    fn missing_required_var_fails_with_its_name() {
        let mut env = base_env();
        env.remove("API_TOKEN");
        let err = config_from(&env).unwrap_err();
        assert!(err.to_string().contains("API_TOKEN"));
    }

    #[test]
    fn inverted_port_range_rejected() {
        let mut env = base_env();
        env.insert("PORT_MIN", "30000");
        env.insert("PORT_MAX", "22001");
        assert!(config_from(&env).is_err());
    }

    #[test]
    fn protected_templates_parsed_from_csv() {
        let mut env = base_env();
        env.insert("PROTECTED_TEMPLATES", "debian-base, golden , ");
        let cfg = config_from(&env).unwrap();
        assert_eq!(cfg.protected_templates, vec!["debian-base", "golden"]);
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let cfg = config_from(&base_env()).unwrap();
        assert_eq!(
            cfg.rootfs_path("vm-0123456789ab"),
            PathBuf::from("/srv/hearth/vms/vm-0123456789ab.ext4")
        );
        assert_eq!(
            cfg.state_path(),
            PathBuf::from("/srv/hearth/vms/state.json")
        );
        assert_eq!(
            cfg.template_image_path("debian-base"),
            PathBuf::from("/srv/hearth/templates/debian-base.ext4")
        );
    }
}
