use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use stockres_core::types::SequenceError;
use stockres_storage::MovementRepositoryError;

use crate::movement::MovementError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

/// RFC 7807 error body.
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }
}

impl From<MovementError> for ProblemResponse {
    fn from(err: MovementError) -> Self {
        let detail = err.to_string();
        match err {
            MovementError::MissingDocumentNumber
            | MovementError::InvalidKey(_)
            | MovementError::Sequence(SequenceError::NonPositive(_)) => {
                Self::new(StatusCode::BAD_REQUEST, "validation_failed", detail)
            }
            MovementError::Sequence(SequenceError::Exhausted(_)) => {
                Self::new(StatusCode::CONFLICT, "sequence_exhausted", detail)
            }
            MovementError::Storage(
                MovementRepositoryError::DuplicateDocument
                | MovementRepositoryError::DuplicateSequence,
            ) => Self::new(StatusCode::CONFLICT, "duplicate_movement", detail),
            MovementError::Storage(source) => {
                error!(stage = "movement", error = %source, "failed to persist stock movement");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_unavailable",
                    "failed to persist stock movement",
                )
            }
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
