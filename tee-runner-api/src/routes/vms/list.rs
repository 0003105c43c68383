use crate::routes::{AppState, Json, vms::VmHandlerError};
use axum::extract::State;
use tee_runner_models::vms::list::VmSummary;

pub(crate) async fn handler(state: State<AppState>) -> Result<Json<Vec<VmSummary>>, VmHandlerError> {
    let vms = state.services.deployment.list_vms().await?;
    Ok(Json(vms))
}
