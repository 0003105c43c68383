use crate::{
    clients::azure::{AzureClient, AzureError},
    repositories::deployment::{DeploymentRecord, DeploymentRepository, DeploymentRepositoryError},
    workers::provisioner::Provisioner,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tee_runner_models::vms::{ImageReference, VmState, create::CreateVmRequest, list::VmSummary};
use tracing::{error, info};
use uuid::Uuid;

/// The VM lifecycle manager. Tracks one record per deployment and delegates the
/// long-running provider work to the provisioner worker; the caller polls `get` for
/// progress.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Create a deployment. The returned record has traversed `requested` and
    /// `provisioning`; the worker drives it from there.
    async fn create_deployment(&self, request: CreateVmRequest) -> Result<DeploymentRecord, CreateDeploymentError>;

    async fn get_deployment(&self, id: Uuid) -> Result<DeploymentRecord, DeploymentLookupError>;

    /// List the VMs the provider reports in the managed resource group.
    async fn list_vms(&self) -> Result<Vec<VmSummary>, ListVmsError>;

    /// Request teardown of a deployment. A no-op when it is already being deleted.
    async fn delete_deployment(&self, id: Uuid) -> Result<(), DeleteDeploymentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CreateDeploymentError {
    #[error("deployment already exists")]
    AlreadyExists,

    #[error("internal: {0}")]
    Internal(String),
}

impl From<DeploymentRepositoryError> for CreateDeploymentError {
    fn from(e: DeploymentRepositoryError) -> Self {
        match e {
            DeploymentRepositoryError::DuplicateDeployment => Self::AlreadyExists,
            e => Self::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeploymentLookupError {
    #[error("deployment not found")]
    NotFound,

    #[error("internal: {0}")]
    Internal(String),
}

impl From<DeploymentRepositoryError> for DeploymentLookupError {
    fn from(e: DeploymentRepositoryError) -> Self {
        match e {
            DeploymentRepositoryError::DeploymentNotFound => Self::NotFound,
            e => Self::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteDeploymentError {
    #[error("deployment not found")]
    NotFound,

    /// In-flight create submissions cannot be cancelled; the provider offers no way to
    /// abort them.
    #[error("deployment is still provisioning")]
    ProvisioningInProgress,

    #[error("internal: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ListVmsError {
    #[error("provider: {0}")]
    Provider(#[from] AzureError),
}

/// Per-deployment defaults applied when the create request leaves them out.
#[derive(Clone, Debug)]
pub struct DeploymentDefaults {
    pub size: String,
    pub image: ImageReference,
    pub security_type: String,
    pub resource_group: String,
    pub location: String,
}

pub struct DeploymentServiceArgs {
    pub repository: Arc<dyn DeploymentRepository>,
    pub azure: Arc<dyn AzureClient>,
    pub provisioner: Arc<dyn Provisioner>,
    pub defaults: DeploymentDefaults,
}

pub struct DefaultDeploymentService {
    repository: Arc<dyn DeploymentRepository>,
    azure: Arc<dyn AzureClient>,
    provisioner: Arc<dyn Provisioner>,
    defaults: DeploymentDefaults,
}

impl DefaultDeploymentService {
    pub fn new(args: DeploymentServiceArgs) -> Self {
        let DeploymentServiceArgs { repository, azure, provisioner, defaults } = args;
        Self { repository, azure, provisioner, defaults }
    }

    fn build_record(&self, request: CreateVmRequest) -> DeploymentRecord {
        let CreateVmRequest { name, size, image, security_type } = request;
        let id = Uuid::new_v4();
        // A short request id suffix keeps VM names unique within the resource group.
        let short_id = &id.to_string()[..8];
        DeploymentRecord {
            id,
            vm_name: format!("{name}-{short_id}"),
            size: size.unwrap_or_else(|| self.defaults.size.clone()),
            image: image.unwrap_or_else(|| self.defaults.image.clone()),
            security_type: security_type.unwrap_or_else(|| self.defaults.security_type.clone()),
            location: self.defaults.location.clone(),
            resource_group: self.defaults.resource_group.clone(),
            state: VmState::Requested,
            public_ip: None,
            sigstruct: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[async_trait]
impl DeploymentService for DefaultDeploymentService {
    async fn create_deployment(&self, request: CreateVmRequest) -> Result<DeploymentRecord, CreateDeploymentError> {
        let record = self.build_record(request);
        let id = record.id;
        info!("Storing deployment {id} for VM {}", record.vm_name);
        self.repository.create(record.clone()).await?;

        info!("Submitting deployment {id} to the provisioner");
        if self.provisioner.submit_provision(record).await.is_err() {
            let state = VmState::Failed { error: "provisioner worker is unavailable".into() };
            if let Err(e) = self.repository.update_state(id, state).await {
                error!("Failed to mark deployment {id} as failed: {e}");
            }
            return Err(CreateDeploymentError::Internal("provisioner worker is unavailable".into()));
        }
        // The submission was accepted, the create call is on its way.
        self.repository.update_state(id, VmState::Provisioning).await?;
        Ok(self.repository.find(id).await?)
    }

    async fn get_deployment(&self, id: Uuid) -> Result<DeploymentRecord, DeploymentLookupError> {
        Ok(self.repository.find(id).await?)
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>, ListVmsError> {
        let vms = self.azure.list_vms().await?;
        let mut summaries = Vec::with_capacity(vms.len());
        for vm in vms {
            let status = self.azure.instance_view(&vm.name).await?;
            let public_ip = self.azure.vm_public_ip(&vm.name).await?;
            let properties = vm.properties;
            summaries.push(VmSummary {
                name: vm.name,
                status: status.display_status.unwrap_or_else(|| "Unknown".into()),
                size: properties.hardware_profile.and_then(|p| p.vm_size).unwrap_or_default(),
                location: vm.location,
                os_type: properties.storage_profile.and_then(|p| p.os_disk).and_then(|d| d.os_type),
                public_ip,
                tags: vm.tags,
            });
        }
        Ok(summaries)
    }

    async fn delete_deployment(&self, id: Uuid) -> Result<(), DeleteDeploymentError> {
        let record = match self.repository.find(id).await {
            Ok(record) => record,
            Err(DeploymentRepositoryError::DeploymentNotFound) => return Err(DeleteDeploymentError::NotFound),
            Err(e) => return Err(DeleteDeploymentError::Internal(e.to_string())),
        };
        match record.state {
            VmState::Deleting | VmState::Deleted => {
                info!("Deployment {id} is already {}", record.state);
                Ok(())
            }
            VmState::Requested | VmState::Provisioning => Err(DeleteDeploymentError::ProvisioningInProgress),
            VmState::Running | VmState::Failed { .. } => {
                info!("Requesting teardown of deployment {id}");
                self.repository
                    .update_state(id, VmState::Deleting)
                    .await
                    .map_err(|e| DeleteDeploymentError::Internal(e.to_string()))?;
                if self.provisioner.submit_teardown(record).await.is_err() {
                    return Err(DeleteDeploymentError::Internal("provisioner worker is unavailable".into()));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::azure::{
            HardwareProfile, MockAzureClient, OsDisk, StorageProfile, VirtualMachine, VirtualMachineProperties,
            VmInstanceState,
        },
        repositories::deployment::MockDeploymentRepository,
        workers::provisioner::{MockProvisioner, SubmitError},
    };
    use mockall::predicate::eq;
    use rstest::rstest;

    struct Builder {
        repository: MockDeploymentRepository,
        azure: MockAzureClient,
        provisioner: MockProvisioner,
        defaults: DeploymentDefaults,
    }

    impl Builder {
        fn build(self) -> DefaultDeploymentService {
            let Self { repository, azure, provisioner, defaults } = self;
            DefaultDeploymentService::new(DeploymentServiceArgs {
                repository: Arc::new(repository),
                azure: Arc::new(azure),
                provisioner: Arc::new(provisioner),
                defaults,
            })
        }
    }

    impl Default for Builder {
        fn default() -> Self {
            Self {
                repository: Default::default(),
                azure: Default::default(),
                provisioner: Default::default(),
                defaults: DeploymentDefaults {
                    size: "Standard_DC1s_v3".into(),
                    image: ImageReference {
                        publisher: "canonical".into(),
                        offer: "0001-com-ubuntu-minimal-focal".into(),
                        sku: "minimal-20_04-lts-gen2".into(),
                        version: "latest".into(),
                    },
                    security_type: "TrustedLaunch".into(),
                    resource_group: "tee-rg".into(),
                    location: "westeurope".into(),
                },
            }
        }
    }

    fn make_request() -> CreateVmRequest {
        CreateVmRequest { name: "tee-vm".into(), size: None, image: None, security_type: None }
    }

    fn make_record(state: VmState) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            vm_name: "tee-vm-12345678".into(),
            size: "Standard_DC1s_v3".into(),
            image: ImageReference {
                publisher: "canonical".into(),
                offer: "0001-com-ubuntu-minimal-focal".into(),
                sku: "minimal-20_04-lts-gen2".into(),
                version: "latest".into(),
            },
            security_type: "TrustedLaunch".into(),
            location: "westeurope".into(),
            resource_group: "tee-rg".into(),
            state,
            public_ip: None,
            sigstruct: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn create_traverses_requested_and_provisioning() {
        let mut builder = Builder::default();
        builder
            .repository
            .expect_create()
            .withf(|record| {
                record.state == VmState::Requested
                    && record.vm_name.starts_with("tee-vm-")
                    && record.size == "Standard_DC1s_v3"
            })
            .once()
            .return_once(|_| Ok(()));
        builder
            .provisioner
            .expect_submit_provision()
            .withf(|record| record.state == VmState::Requested)
            .once()
            .return_once(|_| Ok(()));
        builder
            .repository
            .expect_update_state()
            .withf(|_, state| *state == VmState::Provisioning)
            .once()
            .return_once(|id, _| {
                assert!(!id.is_nil());
                Ok(())
            });
        builder.repository.expect_find().return_once(|id| Ok(DeploymentRecord { id, ..make_record(VmState::Provisioning) }));

        let service = builder.build();
        let record = service.create_deployment(make_request()).await.expect("failed to create");
        assert_eq!(record.state, VmState::Provisioning);
    }

    #[tokio::test]
    async fn create_request_overrides_defaults() {
        let mut builder = Builder::default();
        builder
            .repository
            .expect_create()
            .withf(|record| record.size == "Standard_DC2as_v5")
            .once()
            .return_once(|_| Ok(()));
        builder.provisioner.expect_submit_provision().return_once(|_| Ok(()));
        builder.repository.expect_update_state().return_once(|_, _| Ok(()));
        builder.repository.expect_find().return_once(|id| Ok(DeploymentRecord { id, ..make_record(VmState::Provisioning) }));

        let request = CreateVmRequest { size: Some("Standard_DC2as_v5".into()), ..make_request() };
        builder.build().create_deployment(request).await.expect("failed to create");
    }

    #[tokio::test]
    async fn create_fails_when_worker_is_gone() {
        let mut builder = Builder::default();
        builder.repository.expect_create().return_once(|_| Ok(()));
        builder.provisioner.expect_submit_provision().return_once(|_| Err(SubmitError));
        builder
            .repository
            .expect_update_state()
            .withf(|_, state| matches!(state, VmState::Failed { .. }))
            .once()
            .return_once(|_, _| Ok(()));

        let err = builder.build().create_deployment(make_request()).await.expect_err("create succeeded");
        assert!(matches!(err, CreateDeploymentError::Internal(_)));
    }

    #[tokio::test]
    async fn get_unknown_deployment() {
        let mut builder = Builder::default();
        builder.repository.expect_find().return_once(|_| Err(DeploymentRepositoryError::DeploymentNotFound));

        let err = builder.build().get_deployment(Uuid::new_v4()).await.expect_err("found a ghost");
        assert!(matches!(err, DeploymentLookupError::NotFound));
    }

    #[tokio::test]
    async fn delete_running_deployment() {
        let record = make_record(VmState::Running);
        let id = record.id;
        let mut builder = Builder::default();
        builder.repository.expect_find().with(eq(id)).return_once(move |_| Ok(record));
        builder.repository.expect_update_state().with(eq(id), eq(VmState::Deleting)).once().return_once(|_, _| Ok(()));
        builder
            .provisioner
            .expect_submit_teardown()
            .withf(move |record| record.id == id)
            .once()
            .return_once(|_| Ok(()));

        builder.build().delete_deployment(id).await.expect("failed to delete");
    }

    #[rstest]
    #[case::deleting(VmState::Deleting)]
    #[case::deleted(VmState::Deleted)]
    #[tokio::test]
    async fn delete_is_idempotent(#[case] state: VmState) {
        let record = make_record(state);
        let id = record.id;
        let mut builder = Builder::default();
        builder.repository.expect_find().return_once(move |_| Ok(record));
        // No teardown is submitted and no state is touched.
        builder.build().delete_deployment(id).await.expect("repeated delete failed");
    }

    #[tokio::test]
    async fn delete_unknown_deployment() {
        let mut builder = Builder::default();
        builder.repository.expect_find().return_once(|_| Err(DeploymentRepositoryError::DeploymentNotFound));

        let err = builder.build().delete_deployment(Uuid::new_v4()).await.expect_err("delete succeeded");
        assert!(matches!(err, DeleteDeploymentError::NotFound));
    }

    #[tokio::test]
    async fn delete_while_provisioning_is_rejected() {
        let record = make_record(VmState::Provisioning);
        let id = record.id;
        let mut builder = Builder::default();
        builder.repository.expect_find().return_once(move |_| Ok(record));

        let err = builder.build().delete_deployment(id).await.expect_err("delete succeeded");
        assert!(matches!(err, DeleteDeploymentError::ProvisioningInProgress));
    }

    #[tokio::test]
    async fn list_reports_provider_state() {
        let mut builder = Builder::default();
        let vm = VirtualMachine {
            id: "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/tee-vm-1".into(),
            name: "tee-vm-1".into(),
            location: "westeurope".into(),
            tags: [("env".to_string(), "dev".to_string())].into(),
            properties: VirtualMachineProperties {
                hardware_profile: Some(HardwareProfile { vm_size: Some("Standard_DC1s_v3".into()) }),
                storage_profile: Some(StorageProfile { os_disk: Some(OsDisk { os_type: Some("Linux".into()) }) }),
                network_profile: None,
            },
        };
        builder.azure.expect_list_vms().return_once(move || Ok(vec![vm]));
        builder.azure.expect_instance_view().withf(|name| name == "tee-vm-1").return_once(|_| {
            Ok(VmInstanceState {
                provisioning_state: Some("succeeded".into()),
                power_state: Some("running".into()),
                display_status: Some("VM running".into()),
            })
        });
        builder.azure.expect_vm_public_ip().withf(|name| name == "tee-vm-1").return_once(|_| Ok(Some("20.31.0.7".into())));

        let summaries = builder.build().list_vms().await.expect("failed to list");
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.name, "tee-vm-1");
        assert_eq!(summary.status, "VM running");
        assert_eq!(summary.size, "Standard_DC1s_v3");
        assert_eq!(summary.os_type.as_deref(), Some("Linux"));
        assert_eq!(summary.public_ip.as_deref(), Some("20.31.0.7"));
    }

    #[tokio::test]
    async fn list_propagates_provider_errors() {
        let mut builder = Builder::default();
        builder
            .azure
            .expect_list_vms()
            .return_once(|| Err(AzureError::Api { status: 429, message: "TooManyRequests".into() }));

        let err = builder.build().list_vms().await.expect_err("list succeeded");
        assert!(matches!(err, ListVmsError::Provider(_)));
    }
}
