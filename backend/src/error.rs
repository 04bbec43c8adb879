use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::ErrorResponse;

use crate::imaging::preprocessor::PreprocessError;
use crate::inference::model_client::InferenceError;
use crate::storage::s3_service::StorageError;

pub const MISSING_IMAGE: &str = "missing image data";
pub const MALFORMED_IMAGE: &str = "malformed image data";
pub const MISSING_TEXT: &str = "missing text";
pub const INTERNAL: &str = "internal server error";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("{0}")]
    Decode(String),
    #[error("{0}")]
    Preprocess(String),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Provider(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal server error")]
    Internal,
}

impl From<PreprocessError> for AppError {
    fn from(err: PreprocessError) -> Self {
        match err {
            PreprocessError::Decode(detail) => AppError::Decode(detail),
            PreprocessError::Encode(detail) => AppError::Preprocess(detail),
        }
    }
}

impl From<InferenceError> for AppError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Config(_) => AppError::Config(err.to_string()),
            InferenceError::Provider(_) => AppError::Provider(err.to_string()),
        }
    }
}

impl AppError {
    /// Message placed in the `error` field of the envelope.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Decode(_) => MALFORMED_IMAGE.to_string(),
            AppError::Internal => INTERNAL.to_string(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Decode(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Preprocess(_)
            | AppError::Config(_)
            | AppError::Storage(_)
            | AppError::Provider(_)
            | AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse::new(self.client_message()))
    }
}
