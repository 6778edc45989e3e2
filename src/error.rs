use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::model::Outcome;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request<T: Into<String>>(message: T) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found<T: Into<String>>(message: T) -> Self {
        Self::NotFound(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Setup-time misconfiguration. The only error class surfaced as a hard failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("model {0} has an empty credential")]
    EmptyCredential(String),
    #[error("model descriptor is missing a name")]
    MissingName,
    #[error("model {0} has an empty endpoint")]
    EmptyEndpoint(String),
}

/// Failure of a single provider call. Never escapes the coordinator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ProviderError::Auth(_) => Outcome::AuthError,
            ProviderError::RateLimited(_) => Outcome::RateLimited,
            ProviderError::Timeout => Outcome::Timeout,
            ProviderError::Unknown(_) => Outcome::UnknownError,
        }
    }
}

/// The cache backing store could not serve a request.
#[derive(Debug, Error)]
#[error("cache store unavailable: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new<T: Into<String>>(message: T) -> Self {
        Self(message.into())
    }
}

/// The posts/alerts data store could not serve a query.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal store request failed: {0}")]
    Unavailable(String),
    #[error("signal store returned malformed data: {0}")]
    Malformed(String),
}
