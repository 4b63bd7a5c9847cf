use axum::{routing::get, Extension, Json, Router};
use hearth_types::{HostStats, InfoResp};

use crate::error::{Error, Result};
use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn info(Extension(st): Extension<AppState>) -> Result<Json<InfoResp>> {
    let templates = super::templates::list_templates(&st.config)
        .await
        .map_err(Error::Internal)?;
    let (mem_total_mib, mem_available_mib) = read_meminfo().await;

    Ok(Json(InfoResp {
        vm_count: st.repo.len(),
        template_count: templates.len(),
        host: HostStats {
            cpu_count: num_cpus::get(),
            mem_total_mib,
            mem_available_mib,
            data_dir_free_bytes: st.storage.free_bytes().unwrap_or(0),
        },
    }))
}

async fn read_meminfo() -> (u64, u64) {
    match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(text) => parse_meminfo(&text),
        Err(_) => (0, 0),
    }
}

/// Extract (MemTotal, MemAvailable) in MiB from /proc/meminfo.
fn parse_meminfo(text: &str) -> (u64, u64) {
    let field = |key: &str| -> u64 {
        text.lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kib| kib.parse::<u64>().ok())
            .map(|kib| kib / 1024)
            .unwrap_or(0)
    };
    (field("MemTotal:"), field("MemAvailable:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_fields_parsed_in_mib() {
        let text = "\
MemTotal:       16384000 kB
MemFree:          512000 kB
MemAvailable:    8192000 kB
Buffers:          100000 kB
";
        assert_eq!(parse_meminfo(text), (16000, 8000));
    }

    #[test]
    fn missing_fields_default_to_zero() {
        assert_eq!(parse_meminfo("garbage\n"), (0, 0));
    }
}
