use crate::services::{attestation::AttestationService, deployment::DeploymentService};
use axum::{
    Router,
    extract::{FromRequest, Request, rejection::JsonRejection},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::{ops::Deref, sync::Arc};
use tee_runner_models::errors::RequestHandlerError;
use tower_http::cors::CorsLayer;

pub(crate) mod attestation;
pub(crate) mod vms;

#[derive(Clone)]
pub struct Services {
    pub deployment: Arc<dyn DeploymentService>,
    pub attestation: Arc<dyn AttestationService>,
}

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

/// Build a router for the entire service.
pub fn build_router(state: AppState, api_token: Option<String>) -> Router {
    let mut api = Router::new()
        .route("/vms", post(vms::create::handler).get(vms::list::handler))
        .route("/vms/{id}", get(vms::get::handler).delete(vms::delete::handler))
        .route("/attestation", post(attestation::quote::handler))
        .with_state(state);
    if let Some(token) = api_token {
        api = api.layer(middleware::from_fn(move |request: Request, next: Next| {
            let token = token.clone();
            async move { authenticate(&token, request, next).await }
        }));
    }
    Router::new().route("/health", get(health)).nest("/api/v1", api).layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn authenticate(token: &str, request: Request, next: Next) -> Response {
    let header = request.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok());
    if header.and_then(|value| value.strip_prefix("Bearer ")) == Some(token) {
        return next.run(request).await;
    }
    let payload = RequestHandlerError::new("invalid or missing bearer token", "UNAUTHORIZED");
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// A type that behaves like `axum::Json` but provides JSON structured errors when parsing fails.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, axum::Json<RequestHandlerError>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(value) => Ok(Self(value.0)),
            Err(rejection) => {
                let payload = RequestHandlerError::new(rejection.body_text(), "MALFORMED_REQUEST");
                Err((rejection.status(), axum::Json(payload)))
            }
        }
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}
