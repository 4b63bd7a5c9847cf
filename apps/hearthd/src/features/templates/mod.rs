use axum::{
    routing::{delete, get},
    Router,
};
use chrono::{DateTime, Utc};
use hearth_types::TemplateInfo;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::features::storage;

pub mod routes;

pub fn router() -> Router {
    Router::new()
        .route("/", get(routes::list))
        .route("/:name", delete(routes::delete))
}

pub async fn list_templates(cfg: &Config) -> anyhow::Result<Vec<TemplateInfo>> {
    let mut templates = Vec::new();
    let mut entries = match tokio::fs::read_dir(cfg.templates_dir()).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(templates),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ext4") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let meta = entry.metadata().await?;
        let created_at: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        templates.push(TemplateInfo {
            name: name.to_string(),
            version: read_version(cfg, name).await,
            size_bytes: meta.len(),
            created_at,
        });
    }

    templates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(templates)
}

async fn read_version(cfg: &Config, name: &str) -> u64 {
    match tokio::fs::read_to_string(cfg.template_version_path(name)).await {
        Ok(raw) => raw.trim().parse().unwrap_or(1),
        Err(_) => 1,
    }
}

pub async fn delete_template(cfg: &Config, name: &str) -> Result<()> {
    storage::validate_template_name(name)?;
    if cfg.protected_templates.iter().any(|p| p == name) {
        return Err(Error::Forbidden(format!("template {name} is protected")));
    }

    let image = cfg.template_image_path(name);
    if tokio::fs::metadata(&image).await.is_err() {
        return Err(Error::NotFound(format!("template {name} not found")));
    }

    tokio::fs::remove_file(&image).await?;
    let _ = tokio::fs::remove_file(cfg.template_version_path(name)).await;
    info!(template = name, "template deleted");
    Ok(())
}
