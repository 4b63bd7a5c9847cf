use axum::{middleware, Extension, Router};

use crate::AppState;

pub mod auth;
pub mod reconciler;
pub mod storage;
pub mod system;
pub mod templates;
pub mod vms;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .nest("/vms", vms::router())
        .nest("/templates", templates::router())
        .route_layer(middleware::from_fn(auth::require_bearer));

    Router::new()
        .merge(system::router())
        .merge(protected)
        .layer(Extension(state))
}
