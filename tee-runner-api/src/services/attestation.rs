use crate::{
    clients::{
        attestation::{Measurements, QuoteRunner, QuoteRunnerError, QuoteTarget},
        azure::{AzureClient, AzureError},
    },
    config::AttestationConfig,
};
use async_trait::async_trait;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tee_runner_models::attestation::{AttestationDetails, AttestationRequest, AttestationResponse};
use tokio::time::sleep;
use tracing::{info, warn};

/// Runs remote attestation against a deployed VM by relaying the external helper's
/// RA-TLS handshake. A failed handshake is a successful relay: the response carries
/// `success: false` and the step that broke; only invocation-level problems are errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttestationService: Send + Sync {
    async fn verify_attestation(&self, request: AttestationRequest) -> Result<AttestationResponse, AttestationError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
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

pub struct AttestationServiceArgs {
    pub azure: Arc<dyn AzureClient>,
    pub runner: Arc<dyn QuoteRunner>,
    pub config: AttestationConfig,
}

pub struct DefaultAttestationService {
    azure: Arc<dyn AzureClient>,
    runner: Arc<dyn QuoteRunner>,
    config: AttestationConfig,
}

impl DefaultAttestationService {
    pub fn new(args: AttestationServiceArgs) -> Self {
        let AttestationServiceArgs { azure, runner, config } = args;
        Self { azure, runner, config }
    }

    async fn resolve_host(&self, vm_name: &str) -> Result<String, AttestationError> {
        match self.azure.get_vm(vm_name).await {
            Ok(_) => {}
            Err(AzureError::NotFound) => return Err(AttestationError::VmNotFound),
            Err(e) => return Err(AttestationError::Provider(e.to_string())),
        }
        match self.azure.vm_public_ip(vm_name).await {
            Ok(Some(ip)) => Ok(ip),
            Ok(None) => Err(AttestationError::NoPublicIp),
            Err(e) => Err(AttestationError::Provider(e.to_string())),
        }
    }
}

#[async_trait]
impl AttestationService for DefaultAttestationService {
    async fn verify_attestation(&self, request: AttestationRequest) -> Result<AttestationResponse, AttestationError> {
        let AttestationRequest { vm_name, mrenclave, mrsigner, port, isv_prod_id, isv_svn } = request;
        let host = self.resolve_host(&vm_name).await?;
        let target = QuoteTarget { host: host.clone(), port };
        let measurements = Measurements { mrenclave, mrsigner, isv_prod_id, isv_svn };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.runner.fetch_quote(&target, &measurements).await {
                Ok(output) if output.succeeded() => {
                    info!("Attestation helper finished for {host}:{port} in {:?}", output.duration);
                    let mut details = AttestationDetails {
                        stdout: output.stdout,
                        stderr: output.stderr,
                        exit_code: output.exit_code,
                        duration_seconds: output.duration.as_secs_f64(),
                        error: None,
                    };
                    let success = match verify_handshake_steps(&details.stdout, &host, port) {
                        Ok(()) => true,
                        Err(step_error) => {
                            warn!("Attestation handshake verification failed: {step_error}");
                            details.error = Some(step_error);
                            false
                        }
                    };
                    return Ok(AttestationResponse { success, vm_name, host, details, timestamp: Utc::now() });
                }
                Ok(output) => {
                    warn!(
                        "Attestation helper exited with {:?} (attempt {attempt}/{})",
                        output.exit_code, self.config.max_attempts
                    );
                    if attempt >= self.config.max_attempts {
                        let error = format!("attestation helper exited with status {:?}", output.exit_code);
                        let details = AttestationDetails {
                            stdout: output.stdout,
                            stderr: output.stderr,
                            exit_code: output.exit_code,
                            duration_seconds: output.duration.as_secs_f64(),
                            error: Some(error),
                        };
                        return Ok(AttestationResponse {
                            success: false,
                            vm_name,
                            host,
                            details,
                            timestamp: Utc::now(),
                        });
                    }
                }
                // A hung helper gets no second chance; the caller decides whether to retry.
                Err(QuoteRunnerError::Timeout(timeout)) => return Err(AttestationError::Timeout(timeout)),
                Err(e) => {
                    warn!("Failed to run attestation helper: {e} (attempt {attempt}/{})", self.config.max_attempts);
                    if attempt >= self.config.max_attempts {
                        return Err(AttestationError::Helper(e.to_string()));
                    }
                }
            }
            sleep(self.config.retry_delay).await;
        }
    }
}

/// Check that every expected RA-TLS handshake step appears in the helper's stdout, in
/// order. Later steps must appear after earlier ones; the first missing step wins.
fn verify_handshake_steps(stdout: &str, host: &str, port: u16) -> Result<(), String> {
    let expected_steps = [
        (
            "Seeding the random number generator... ok".to_string(),
            "seeding the random number generator failed".to_string(),
        ),
        (format!("Connecting to tcp/{host}/{port}... ok"), format!("connecting to tcp/{host}/{port} failed")),
        ("Setting up the SSL/TLS structure... ok".into(), "setting up the SSL/TLS structure failed".into()),
        (
            "Setting certificate verification mode for RA-TLS... ok".into(),
            "setting certificate verification mode for RA-TLS failed".into(),
        ),
        ("Installing RA-TLS callback ... ok".into(), "installing RA-TLS callback failed".into()),
        ("Performing the SSL/TLS handshake...".into(), "performing the SSL/TLS handshake failed".into()),
        ("Handshake completed... ok".into(), "handshake did not complete successfully".into()),
        ("Verifying peer X.509 certificate... ok".into(), "peer X.509 certificate verification failed".into()),
        ("GET /health HTTP/1.1".into(), "health request was not sent".into()),
        (format!("Host: {host}:{port}"), format!("host header does not match {host}:{port}")),
        ("HTTP/1.1 200 OK".into(), "no successful health response was received".into()),
        ("Server is running".into(), "server is not running as expected".into()),
    ];

    let mut current_index = 0;
    for (expected, error) in expected_steps {
        match stdout[current_index..].find(&expected) {
            // Subsequent steps must appear later in the output.
            Some(position) => current_index += position + expected.len(),
            None => return Err(error),
        }
    }
    Ok(())
}
