use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use mongodb::bson::doc;
use thiserror::Error;
use tracing::error;
use validator::ValidationErrors;

use crate::store::StoreError;

/// Error returned by every handler; rendered as `{"message": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid_id(id: &str) -> Self {
        ApiError::BadRequest(format!("Invalid ID format: {}", id))
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        ApiError::BadRequest(errors.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Store(StoreError::Duplicate(_) | StoreError::InsufficientStock(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(StoreError::Conflict) => StatusCode::CONFLICT,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            ApiError::Store(StoreError::Duplicate(what)) => format!("{} already exists", what),
            ApiError::Store(StoreError::InsufficientStock(_)) => "Product out of stock".to_string(),
            ApiError::Store(StoreError::Conflict) => {
                "Request conflicted with another update, please retry".to_string()
            }
            ApiError::Store(_) | ApiError::Internal(_) => {
                error!("Request failed: {}", self);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        HttpResponse::build(self.status_code()).json(doc! { "message": message })
    }
}
