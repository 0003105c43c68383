use crate::routes::{AppState, Json, attestation::AttestationHandlerError};
use axum::extract::State;
use tee_runner_models::attestation::{AttestationRequest, AttestationResponse};
use validator::Validate;

pub(crate) async fn handler(
    state: State<AppState>,
    request: Json<AttestationRequest>,
) -> Result<Json<AttestationResponse>, AttestationHandlerError> {
    request.validate().map_err(|e| AttestationHandlerError::Validation(e.to_string()))?;
    let response = state.services.attestation.verify_attestation(request.0).await?;
    Ok(Json(response))
}
