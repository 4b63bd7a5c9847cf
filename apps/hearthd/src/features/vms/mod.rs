use axum::{
    routing::{get, post},
    Router,
};

pub mod alloc;
pub mod forwarder;
pub mod names;
pub mod repo;
pub mod routes; // handlers
pub mod service; // lifecycle pipelines

pub fn router() -> Router {
    Router::new()
        .route("/", post(routes::create).get(routes::list))
        .route("/:id", get(routes::get).delete(routes::delete))
        .route("/:id/snapshot", post(routes::snapshot))
}
