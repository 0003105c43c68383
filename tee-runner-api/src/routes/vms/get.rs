use crate::routes::{AppState, Json, vms::VmHandlerError};
use axum::extract::{Path, State};
use tee_runner_models::vms::get::VmDeployment;
use uuid::Uuid;

pub(crate) async fn handler(state: State<AppState>, path: Path<Uuid>) -> Result<Json<VmDeployment>, VmHandlerError> {
    let record = state.services.deployment.get_deployment(path.0).await?;
    Ok(Json(record.into()))
}
