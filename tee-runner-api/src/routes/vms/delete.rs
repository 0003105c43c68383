use crate::routes::{AppState, Json, vms::VmHandlerError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

pub(crate) async fn handler(
    state: State<AppState>,
    path: Path<Uuid>,
) -> Result<(StatusCode, Json<()>), VmHandlerError> {
    state.services.deployment.delete_deployment(path.0).await?;
    Ok((StatusCode::ACCEPTED, Json(())))
}
