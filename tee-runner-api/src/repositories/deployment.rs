use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tee_runner_models::vms::{ImageReference, SigstructData, VmState};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A tracked deployment. This doubles as the operation record for the in-flight
/// provider call: the state tag says whether that operation is still pending.
///
/// Records live in process memory only; the provider remains the authority on the
/// actual resources.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub vm_name: String,
    pub size: String,
    pub image: ImageReference,
    pub security_type: String,
    pub location: String,
    pub resource_group: String,
    pub state: VmState,
    pub public_ip: Option<String>,
    pub sigstruct: Option<SigstructData>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq)]
pub enum DeploymentRepositoryError {
    #[error("deployment already exists")]
    DuplicateDeployment,

    #[error("deployment not found")]
    DeploymentNotFound,

    #[error("illegal state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, DeploymentRepositoryError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn create(&self, record: DeploymentRecord) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<DeploymentRecord>;

    async fn list(&self) -> Result<Vec<DeploymentRecord>>;

    /// Move a deployment to a new lifecycle state, enforcing transition legality.
    async fn update_state(&self, id: Uuid, state: VmState) -> Result<()>;

    async fn set_public_ip(&self, id: Uuid, public_ip: String) -> Result<()>;

    async fn set_sigstruct(&self, id: Uuid, sigstruct: SigstructData) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryDeploymentRepository {
    deployments: Mutex<HashMap<Uuid, DeploymentRecord>>,
}

impl InMemoryDeploymentRepository {
    async fn update<F>(&self, id: Uuid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut DeploymentRecord) -> Result<()>,
    {
        let mut deployments = self.deployments.lock().await;
        let record = deployments.get_mut(&id).ok_or(DeploymentRepositoryError::DeploymentNotFound)?;
        apply(record)
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
    async fn create(&self, record: DeploymentRecord) -> Result<()> {
        let mut deployments = self.deployments.lock().await;
        if deployments.contains_key(&record.id) {
            return Err(DeploymentRepositoryError::DuplicateDeployment);
        }
        deployments.insert(record.id, record);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<DeploymentRecord> {
        let deployments = self.deployments.lock().await;
        deployments.get(&id).cloned().ok_or(DeploymentRepositoryError::DeploymentNotFound)
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let deployments = self.deployments.lock().await;
        Ok(deployments.values().cloned().collect())
    }

    async fn update_state(&self, id: Uuid, state: VmState) -> Result<()> {
        self.update(id, |record| {
            if !record.state.can_transition_to(&state) {
                return Err(DeploymentRepositoryError::InvalidTransition {
                    from: record.state.to_string(),
                    to: state.to_string(),
                });
            }
            // A settled state closes the pending operation; entering `deleting` opens
            // a new one.
            record.finished_at = state.is_settled().then(Utc::now);
            record.state = state;
            Ok(())
        })
        .await
    }

    async fn set_public_ip(&self, id: Uuid, public_ip: String) -> Result<()> {
        self.update(id, |record| {
            record.public_ip = Some(public_ip);
            Ok(())
        })
        .await
    }

    async fn set_sigstruct(&self, id: Uuid, sigstruct: SigstructData) -> Result<()> {
        self.update(id, |record| {
            record.sigstruct = Some(sigstruct);
            Ok(())
        })
        .await
    }
}
