use crate::{
    routes::{AppState, Json},
    services::deployment::CreateDeploymentError,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use strum::EnumDiscriminants;
use tee_runner_models::{
    errors::RequestHandlerError,
    vms::create::{CreateVmRequest, CreateVmResponse},
};
use tracing::error;
use validator::Validate;

pub(crate) async fn handler(
    state: State<AppState>,
    request: Json<CreateVmRequest>,
) -> Result<(StatusCode, Json<CreateVmResponse>), HandlerError> {
    request.validate().map_err(|e| HandlerError::Validation(e.to_string()))?;
    let record = state.services.deployment.create_deployment(request.0).await?;
    let response = CreateVmResponse {
        id: record.id,
        vm_name: record.vm_name,
        state: record.state,
        created_at: record.created_at,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, thiserror::Error, EnumDiscriminants)]
pub(crate) enum HandlerError {
    #[error("{0}")]
    Validation(String),

    #[error("deployment already exists")]
    AlreadyExists,

    #[error("internal: {0}")]
    Internal(String),
}

impl From<CreateDeploymentError> for HandlerError {
    fn from(e: CreateDeploymentError) -> Self {
        match e {
            CreateDeploymentError::AlreadyExists => Self::AlreadyExists,
            CreateDeploymentError::Internal(e) => Self::Internal(e),
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let discriminant = HandlerErrorDiscriminants::from(&self);
        let (code, message) = match self {
            Self::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::AlreadyExists => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Internal(e) => {
                error!("Failed to create deployment: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        };
        let response = RequestHandlerError::new(message, format!("{discriminant:?}"));
        (code, Json(response)).into_response()
    }
}
