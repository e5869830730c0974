use agora_node::NodeError;
use agora_sync::FetchError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// JSON body of every error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Stable machine-readable kind, e.g. `no_peers` or `timeout`.
    pub kind: String,
}

impl ServerError {
    /// Status code and error kind. Offline and slow-network body reads get
    /// different codes so clients can render them differently.
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Node(NodeError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Node(NodeError::InvalidInput(_)) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Node(NodeError::Superseded(_)) => (StatusCode::CONFLICT, "superseded"),
            Self::Node(NodeError::Fetch(fetch)) => match fetch {
                FetchError::NoPeers => (StatusCode::SERVICE_UNAVAILABLE, "no_peers"),
                FetchError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                FetchError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                FetchError::Integrity { .. } => (StatusCode::BAD_GATEWAY, "integrity"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, kind) = self.classify();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind: kind.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::ContentId;

    #[test]
    fn fetch_failures_map_to_distinct_statuses() {
        let cid = ContentId::for_body(b"x");
        let offline = ServerError::from(NodeError::Fetch(FetchError::NoPeers));
        let slow = ServerError::from(NodeError::Fetch(FetchError::Timeout { cid, after_ms: 10 }));
        let absent = ServerError::from(NodeError::Fetch(FetchError::NotFound(cid)));
        assert_eq!(offline.classify(), (StatusCode::SERVICE_UNAVAILABLE, "no_peers"));
        assert_eq!(slow.classify(), (StatusCode::GATEWAY_TIMEOUT, "timeout"));
        assert_eq!(absent.classify().0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn input_errors_are_client_errors() {
        assert_eq!(
            ServerError::BadRequest("cid".into()).classify().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::from(NodeError::InvalidInput("x".into())).classify().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::Internal("boom".into()).classify().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
