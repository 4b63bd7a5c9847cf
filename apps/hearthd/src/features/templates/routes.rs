use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use hearth_types::ListTemplatesResp;

use crate::error::{Error, Result};
use crate::AppState;

pub async fn list(Extension(st): Extension<AppState>) -> Result<Json<ListTemplatesResp>> {
    let templates = super::list_templates(&st.config)
        .await
        .map_err(Error::Internal)?;
    Ok(Json(ListTemplatesResp { templates }))
}

pub async fn delete(
    Extension(st): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    super::delete_template(&st.config, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}
