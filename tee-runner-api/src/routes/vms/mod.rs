use crate::{
    repositories::deployment::DeploymentRecord,
    routes::Json,
    services::deployment::{DeleteDeploymentError, DeploymentLookupError, ListVmsError},
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use strum::EnumDiscriminants;
use tee_runner_models::{errors::RequestHandlerError, vms::get::VmDeployment};
use tracing::error;

pub(crate) mod create;
pub(crate) mod delete;
pub(crate) mod get;
pub(crate) mod list;

impl From<DeploymentRecord> for VmDeployment {
    fn from(record: DeploymentRecord) -> Self {
        let DeploymentRecord {
            id,
            vm_name,
            size,
            image: _,
            security_type,
            location,
            resource_group,
            state,
            public_ip,
            sigstruct,
            created_at,
            finished_at,
        } = record;
        Self {
            id,
            vm_name,
            state,
            size,
            security_type,
            location,
            resource_group,
            public_ip,
            sigstruct,
            created_at,
            finished_at,
        }
    }
}

#[derive(Debug, thiserror::Error, EnumDiscriminants)]
pub(crate) enum VmHandlerError {
    #[error("deployment not found")]
    NotFound,

    #[error("deployment is still provisioning")]
    ProvisioningInProgress,

    #[error("provider: {0}")]
    Provider(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<DeploymentLookupError> for VmHandlerError {
    fn from(e: DeploymentLookupError) -> Self {
        match e {
            DeploymentLookupError::NotFound => Self::NotFound,
            DeploymentLookupError::Internal(e) => Self::Internal(e),
        }
    }
}

impl From<DeleteDeploymentError> for VmHandlerError {
    fn from(e: DeleteDeploymentError) -> Self {
        match e {
            DeleteDeploymentError::NotFound => Self::NotFound,
            DeleteDeploymentError::ProvisioningInProgress => Self::ProvisioningInProgress,
            DeleteDeploymentError::Internal(e) => Self::Internal(e),
        }
    }
}

impl From<ListVmsError> for VmHandlerError {
    fn from(e: ListVmsError) -> Self {
        match e {
            ListVmsError::Provider(e) => Self::Provider(e.to_string()),
        }
    }
}

impl IntoResponse for VmHandlerError {
    fn into_response(self) -> Response {
        let discriminant = VmHandlerErrorDiscriminants::from(&self);
        let (code, message) = match self {
            Self::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::ProvisioningInProgress => (StatusCode::CONFLICT, self.to_string()),
            // The provider's message is relayed for diagnosis.
            Self::Provider(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            Self::Internal(e) => {
                error!("Failed to process request: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        };
        let response = RequestHandlerError::new(message, format!("{discriminant:?}"));
        (code, Json(response)).into_response()
    }
}
