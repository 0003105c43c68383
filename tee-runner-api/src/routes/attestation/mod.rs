use crate::{routes::Json, services::attestation::AttestationError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use strum::EnumDiscriminants;
use tee_runner_models::errors::RequestHandlerError;
use tracing::error;

pub(crate) mod quote;

#[derive(Debug, thiserror::Error, EnumDiscriminants)]
pub(crate) enum AttestationHandlerError {
    #[error("{0}")]
    Validation(String),

    #[error("vm not found")]
    VmNotFound,

    #[error("vm has no public ip address")]
    NoPublicIp,

    #[error("provider: {0}")]
    Provider(String),

    #[error("attestation helper timed out after {0:?}")]
    Timeout(Duration),

    #[error("attestation helper failed: {0}")]
    Helper(String),
}

impl From<AttestationError> for AttestationHandlerError {
    fn from(e: AttestationError) -> Self {
        match e {
            AttestationError::VmNotFound => Self::VmNotFound,
            AttestationError::NoPublicIp => Self::NoPublicIp,
            AttestationError::Provider(e) => Self::Provider(e),
            AttestationError::Timeout(timeout) => Self::Timeout(timeout),
            AttestationError::Helper(e) => Self::Helper(e),
        }
    }
}

impl IntoResponse for AttestationHandlerError {
    fn into_response(self) -> Response {
        let discriminant = AttestationHandlerErrorDiscriminants::from(&self);
        let (code, message) = match self {
            Self::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::VmNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::NoPublicIp => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Provider(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            Self::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            Self::Helper(e) => {
                error!("Attestation helper failed: {e}");
                (StatusCode::BAD_GATEWAY, format!("attestation helper failed: {e}"))
            }
        };
        let response = RequestHandlerError::new(message, format!("{discriminant:?}"));
        (code, Json(response)).into_response()
    }
}
