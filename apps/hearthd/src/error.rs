use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Domain errors surfaced by the lifecycle engine. Each variant maps to one
/// HTTP status; plumbing failures travel through `Internal` unchanged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    ExhaustedStorage(String),
    #[error("{0}")]
    Backend(String),
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ResourceExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ExhaustedStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
            Error::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = ?self, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_map_to_expected_statuses() {
        assert_eq!(
            Error::InvalidArgument("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("missing".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Forbidden("protected".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::Conflict("exists".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::ExhaustedStorage("full".into()).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            Error::ResourceExhausted("ports".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::Unavailable("socket".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn io_errors_become_internal() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire").into();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
