use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

use crate::{
    campaigns::ScheduleError, delivery::DeliveryError, flows::EngineError, ivr::CallError,
    jobs::JobQueueError, shared::StoreError,
};

pub type CoreResult<T> = Result<T, CoreError>;

/// Failures that abort the current batch or tick. Skips and terminal delivery
/// failures are not errors and never show up here.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("shared store error: {0}")]
    Store(#[from] StoreError),
    #[error("flow engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("call provider error: {0}")]
    Call(#[from] CallError),
    #[error("scheduling error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("job queue error: {0}")]
    Jobs(#[from] JobQueueError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<CoreError> for AppError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::Validation(message) => AppError::bad_request(message),
            CoreError::Schedule(err) => AppError::bad_request(err.to_string()),
            CoreError::NotFound(what) => AppError::new(StatusCode::NOT_FOUND, format!("{what} not found")),
            CoreError::Database(diesel::result::Error::NotFound) => AppError::not_found(),
            other => AppError::internal(other),
        }
    }
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        CoreError::from(value).into()
    }
}

impl From<JobQueueError> for AppError {
    fn from(value: JobQueueError) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::bad_request(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err: AppError = CoreError::validation("unknown event kind").into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_rows_map_to_not_found() {
        let err: AppError = diesel::result::Error::NotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: AppError = CoreError::not_found("org").into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn infrastructure_errors_map_to_internal() {
        let err: AppError = CoreError::Store(StoreError::Unavailable("down".into())).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
