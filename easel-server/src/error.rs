use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use easel_core::{LoadError, OrchestratorError};
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "code": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::Busy => StatusCode::CONFLICT,
            OrchestratorError::NoModel => StatusCode::PRECONDITION_FAILED,
            OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Load(LoadError::NotFound(_)) => StatusCode::NOT_FOUND,
            OrchestratorError::Load(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Spawn(_)
            | OrchestratorError::Gallery(_)
            | OrchestratorError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}
