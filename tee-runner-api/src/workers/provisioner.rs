use crate::{
    clients::azure::{AzureClient, AzureError, VmProvisionSpec},
    config::Config,
    repositories::deployment::{DeploymentRecord, DeploymentRepository, DeploymentRepositoryError},
};
use async_trait::async_trait;
use metrics::{counter, gauge};
use std::{collections::HashMap, sync::Arc, time::Duration};
use strum::EnumDiscriminants;
use tee_runner_models::vms::{SigstructData, VmState};
use thiserror::Error;
use tokio::{
    select,
    sync::mpsc::{Receiver, Sender, channel},
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tracing::{Instrument, debug, error, info, info_span, warn};

const WORKER_CHANNEL_SIZE: usize = 64;

const SIGSTRUCT_START_MARKER: &str = "--- SIGSTRUCT_DATA_START ---";
const SIGSTRUCT_END_MARKER: &str = "--- SIGSTRUCT_DATA_END ---";

/// Accepts lifecycle submissions for background execution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Hand a deployment to the provisioning pipeline.
    async fn submit_provision(&self, record: DeploymentRecord) -> std::result::Result<(), SubmitError>;

    /// Hand a deployment to the teardown pipeline.
    async fn submit_teardown(&self, record: DeploymentRecord) -> std::result::Result<(), SubmitError>;
}

#[derive(Debug, Error)]
#[error("provisioner worker is unavailable")]
pub struct SubmitError;

pub struct ProvisionerSettings {
    pub subnet_id: String,
    pub admin_username: String,
    pub ssh_public_key: String,
    pub secure_boot: bool,
    pub vtpm: bool,
    pub container_image: String,
    pub poll_interval: Duration,
    pub provision_timeout: Duration,
    pub watch_interval: Duration,
}

impl ProvisionerSettings {
    pub fn from_config(config: &Config) -> Self {
        let vm = &config.vm;
        Self {
            subnet_id: config.azure.subnet_id(),
            admin_username: vm.admin_username.clone(),
            ssh_public_key: vm.ssh_public_key.clone(),
            secure_boot: vm.secure_boot,
            vtpm: vm.vtpm,
            container_image: vm.container_image.clone(),
            poll_interval: vm.poll_interval,
            provision_timeout: vm.provision_timeout,
            watch_interval: vm.watch_interval,
        }
    }
}

pub struct ProvisionerArgs {
    pub azure: Arc<dyn AzureClient>,
    pub repository: Arc<dyn DeploymentRepository>,
    pub settings: ProvisionerSettings,
}

/// Submits commands to the worker over a bounded channel.
pub struct ChannelProvisioner {
    sender: Sender<Command>,
}

#[async_trait]
impl Provisioner for ChannelProvisioner {
    async fn submit_provision(&self, record: DeploymentRecord) -> std::result::Result<(), SubmitError> {
        self.sender.send(Command::Provision { record }).await.map_err(|_| SubmitError)
    }

    async fn submit_teardown(&self, record: DeploymentRecord) -> std::result::Result<(), SubmitError> {
        self.sender.send(Command::Teardown { record }).await.map_err(|_| SubmitError)
    }
}

#[derive(Debug, EnumDiscriminants)]
enum Command {
    Provision { record: DeploymentRecord },
    Teardown { record: DeploymentRecord },
}

pub struct ProvisionerWorker {
    pipeline: Pipeline,
    receiver: Receiver<Command>,
    watch_interval: Duration,
}

impl ProvisionerWorker {
    pub fn spawn(args: ProvisionerArgs) -> ChannelProvisioner {
        let ProvisionerArgs { azure, repository, settings } = args;
        let (sender, receiver) = channel(WORKER_CHANNEL_SIZE);
        let watch_interval = settings.watch_interval;
        let pipeline = Pipeline { azure, repository, settings: Arc::new(settings) };
        tokio::spawn(async move {
            let worker = Self { pipeline, receiver, watch_interval };
            worker.run().await;
            warn!("Provisioner worker loop exited");
        });
        ChannelProvisioner { sender }
    }

    async fn run(mut self) {
        let mut ticker = interval(self.watch_interval);
        // If we miss a tick, shift the ticks to be aligned with when we called `Interval::tick`.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                command = self.receiver.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command);
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.pipeline.reconcile().await {
                        error!("Failed to reconcile provider state: {e}");
                    }
                }
            }
        }
    }

    /// Pipelines run in their own task so a slow provider call never blocks the
    /// command loop or the reconciliation tick.
    fn handle_command(&self, command: Command) {
        let discriminant = CommandDiscriminants::from(&command);
        info!("Received {discriminant:?} command");
        let pipeline = self.pipeline.clone();
        match command {
            Command::Provision { record } => {
                let span = info_span!("provision", deployment_id = record.id.to_string());
                tokio::spawn(async move { pipeline.provision(record).await }.instrument(span));
            }
            Command::Teardown { record } => {
                let span = info_span!("teardown", deployment_id = record.id.to_string());
                tokio::spawn(async move { pipeline.teardown(record).await }.instrument(span));
            }
        }
    }
}

#[derive(Debug, Error)]
enum ProvisionError {
    #[error(transparent)]
    Azure(#[from] AzureError),

    #[error("VM did not reach the running state within {0:?}")]
    ReadyTimeout(Duration),
}

#[derive(Clone)]
struct Pipeline {
    azure: Arc<dyn AzureClient>,
    repository: Arc<dyn DeploymentRepository>,
    settings: Arc<ProvisionerSettings>,
}

impl Pipeline {
    async fn provision(self, record: DeploymentRecord) {
        let id = record.id;
        match self.run_provision_steps(&record).await {
            Ok(()) => info!("Deployment {id} is running"),
            Err(e) => {
                counter!("vm_provision_failures_total").increment(1);
                error!("Provisioning of {} failed: {e}", record.vm_name);
                self.set_state(id, VmState::Failed { error: e.to_string() }).await;
            }
        }
    }

    async fn run_provision_steps(&self, record: &DeploymentRecord) -> Result<(), ProvisionError> {
        let vm_name = &record.vm_name;
        let settings = &self.settings;
        let nsg_id = self.azure.create_network_security_group(&format!("{vm_name}-nsg")).await?;
        let public_ip_id = self.azure.create_public_ip(&format!("{vm_name}-ip")).await?;
        let nic_id = self
            .azure
            .create_network_interface(&format!("{vm_name}-nic"), &settings.subnet_id, &public_ip_id, &nsg_id)
            .await?;

        let spec = VmProvisionSpec {
            size: record.size.clone(),
            image: record.image.clone(),
            admin_username: settings.admin_username.clone(),
            ssh_public_key: settings.ssh_public_key.clone(),
            security_type: record.security_type.clone(),
            secure_boot: settings.secure_boot,
            vtpm: settings.vtpm,
        };
        self.azure.create_vm(vm_name, &nic_id, &spec).await?;
        self.wait_vm_ready(vm_name).await?;

        self.configure_vm(record).await;

        match self.azure.vm_public_ip(vm_name).await? {
            Some(public_ip) => {
                info!("VM {vm_name} is reachable at {public_ip}");
                if let Err(e) = self.repository.set_public_ip(record.id, public_ip).await {
                    error!("Failed to store public IP for {}: {e}", record.id);
                }
            }
            None => warn!("VM {vm_name} has no public IP address"),
        }

        self.set_state(record.id, VmState::Running).await;
        Ok(())
    }

    async fn wait_vm_ready(&self, vm_name: &str) -> Result<(), ProvisionError> {
        info!("Waiting for VM {vm_name} to be ready");
        let deadline = Instant::now() + self.settings.provision_timeout;
        loop {
            match self.azure.instance_view(vm_name).await {
                Ok(view) if view.is_ready() => {
                    info!("VM {vm_name} is fully provisioned and running");
                    return Ok(());
                }
                Ok(view) => {
                    debug!(
                        "VM {vm_name} not ready yet (provisioning: {:?}, power: {:?})",
                        view.provisioning_state, view.power_state
                    );
                }
                // The instance view can lag behind the create call; keep polling.
                Err(e) => warn!("Failed to check status of VM {vm_name}: {e}"),
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::ReadyTimeout(self.settings.provision_timeout));
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Run the container setup script on the freshly provisioned VM and record the
    /// enclave identity it prints. Best effort: a failed setup leaves the VM running.
    async fn configure_vm(&self, record: &DeploymentRecord) {
        let script = render_setup_script(&self.settings.container_image);
        match self.azure.run_setup_script(&record.vm_name, &script).await {
            Ok(messages) => match parse_sigstruct(&messages) {
                Some(sigstruct) => {
                    info!("Extracted sigstruct data from setup output: {sigstruct:?}");
                    if let Err(e) = self.repository.set_sigstruct(record.id, sigstruct).await {
                        error!("Failed to store sigstruct for {}: {e}", record.id);
                    }
                }
                None => warn!("Setup script output contained no sigstruct data"),
            },
            Err(e) => {
                counter!("vm_setup_script_failures_total").increment(1);
                warn!("Setup script failed on {}: {e}", record.vm_name);
            }
        }
    }

    async fn teardown(self, record: DeploymentRecord) {
        let id = record.id;
        match self.run_teardown_steps(&record).await {
            Ok(()) => {
                self.set_state(id, VmState::Deleted).await;
                info!("Deployment {id} deleted");
            }
            Err(e) => {
                counter!("vm_teardown_failures_total").increment(1);
                error!("Teardown of {} failed: {e}", record.vm_name);
                self.set_state(id, VmState::Failed { error: e.to_string() }).await;
            }
        }
    }

    async fn run_teardown_steps(&self, record: &DeploymentRecord) -> Result<(), AzureError> {
        let vm_name = &record.vm_name;
        Self::tolerate_missing(self.azure.delete_vm(vm_name).await, vm_name, "VM")?;
        let result = self.azure.delete_network_interface(&format!("{vm_name}-nic")).await;
        Self::tolerate_missing(result, vm_name, "network interface")?;
        let result = self.azure.delete_public_ip(&format!("{vm_name}-ip")).await;
        Self::tolerate_missing(result, vm_name, "public IP")?;
        let result = self.azure.delete_network_security_group(&format!("{vm_name}-nsg")).await;
        Self::tolerate_missing(result, vm_name, "network security group")?;
        Ok(())
    }

    fn tolerate_missing(result: Result<(), AzureError>, vm_name: &str, resource: &str) -> Result<(), AzureError> {
        match result {
            Err(AzureError::NotFound) => {
                warn!("The {resource} of {vm_name} was already deleted");
                Ok(())
            }
            other => other,
        }
    }

    /// Reconcile local records against the provider-reported state and refresh the
    /// per-state gauges.
    async fn reconcile(&self) -> Result<(), DeploymentRepositoryError> {
        debug!("Reconciling deployments against provider state");
        let records = self.repository.list().await?;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in &records {
            *counts.entry(record.state.to_string()).or_default() += 1;
        }
        for (state, count) in counts {
            gauge!("deployments_total", "state" => state).set(count as f64);
        }

        for record in records {
            if record.state != VmState::Running {
                continue;
            }
            match self.azure.instance_view(&record.vm_name).await {
                Err(AzureError::NotFound) => {
                    info!("VM {} was deleted out of band, marking it deleted", record.vm_name);
                    self.set_state(record.id, VmState::Deleted).await;
                }
                Ok(view) if !view.is_ready() => {
                    warn!("Provider reports VM {} as {:?}", record.vm_name, view.display_status);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to check VM {}: {e}", record.vm_name),
            }
        }
        Ok(())
    }

    async fn set_state(&self, id: uuid::Uuid, state: VmState) {
        if let Err(e) = self.repository.update_state(id, state).await {
            error!("Failed to update state of deployment {id}: {e}");
        }
    }
}

/// The script ran on new VMs: installs docker, extracts the enclave sigstruct from the
/// application image and leaves the RA-TLS server container running on port 443.
fn render_setup_script(container_image: &str) -> String {
    format!(
        r#"#!/bin/bash
set -e

echo "Updating system packages..."
sudo apt-get update
sudo apt-get upgrade -y

echo "Installing Docker..."
sudo apt-get install -y apt-transport-https ca-certificates curl software-properties-common
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo apt-key add -
sudo add-apt-repository "deb [arch=amd64] https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable"
sudo apt-get update
sudo apt-get install -y docker-ce

echo "Pulling application image..."
sudo docker pull {container_image}

echo "Extracting sigstruct data..."
TEMP_CONTAINER_ID=$(sudo docker run -d --name temp-container \
    --device=/dev/sgx_enclave \
    --device=/dev/sgx_provision \
    {container_image})
sleep 5
echo "{SIGSTRUCT_START_MARKER}"
sudo docker exec $TEMP_CONTAINER_ID /bin/bash -c "gramine-sgx-sigstruct-view sgx-mvp.sig"
echo "{SIGSTRUCT_END_MARKER}"
sudo docker stop $TEMP_CONTAINER_ID
sudo docker rm $TEMP_CONTAINER_ID

if sudo docker ps -a | grep -q ntls-server; then
    sudo docker rm -f ntls-server
fi

echo "Starting RA-TLS server container..."
sudo docker run -d -p 443:8081 \
    --restart=unless-stopped \
    --name ntls-server \
    --device=/dev/sgx_enclave \
    --device=/dev/sgx_provision \
    {container_image}

echo "Setup completed successfully!"
"#
    )
}

/// Extract the sigstruct fields from the marked section of the extension output.
/// Returns `None` unless all fields are present.
fn parse_sigstruct(messages: &[String]) -> Option<SigstructData> {
    let message = messages.iter().find(|m| m.contains(SIGSTRUCT_START_MARKER))?;
    let start = message.find(SIGSTRUCT_START_MARKER)? + SIGSTRUCT_START_MARKER.len();
    let end = message.find(SIGSTRUCT_END_MARKER)?;
    let block = message.get(start..end)?;

    let mut mr_enclave = None;
    let mut mr_signer = None;
    let mut isv_prod_id = None;
    let mut isv_svn = None;
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "mr_enclave" => mr_enclave = Some(value),
            "mr_signer" => mr_signer = Some(value),
            "isv_prod_id" => isv_prod_id = Some(value),
            "isv_svn" => isv_svn = Some(value),
            _ => {}
        }
    }
    Some(SigstructData {
        mr_enclave: mr_enclave?,
        mr_signer: mr_signer?,
        isv_prod_id: isv_prod_id?,
        isv_svn: isv_svn?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::azure::{MockAzureClient, VmInstanceState},
        repositories::deployment::MockDeploymentRepository,
    };
    use chrono::Utc;
    use mockall::predicate::eq;
    use tee_runner_models::vms::ImageReference;
    use uuid::Uuid;

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

    fn make_settings() -> ProvisionerSettings {
        ProvisionerSettings {
            subnet_id: "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/default".into(),
            admin_username: "azureuser".into(),
            ssh_public_key: "ssh-ed25519 AAAA".into(),
            secure_boot: true,
            vtpm: true,
            container_image: "example/ra-tls-server:v1".into(),
            poll_interval: Duration::from_millis(1),
            provision_timeout: Duration::from_millis(50),
            watch_interval: Duration::from_secs(30),
        }
    }

    struct Builder {
        azure: MockAzureClient,
        repository: MockDeploymentRepository,
        settings: ProvisionerSettings,
    }

    impl Builder {
        fn build(self) -> Pipeline {
            let Self { azure, repository, settings } = self;
            Pipeline { azure: Arc::new(azure), repository: Arc::new(repository), settings: Arc::new(settings) }
        }
    }

    impl Default for Builder {
        fn default() -> Self {
            Self { azure: MockAzureClient::new(), repository: MockDeploymentRepository::new(), settings: make_settings() }
        }
    }

    fn ready_state() -> VmInstanceState {
        VmInstanceState {
            provisioning_state: Some("succeeded".into()),
            power_state: Some("running".into()),
            display_status: Some("VM running".into()),
        }
    }

    fn sigstruct_message() -> String {
        format!(
            "stdout: {SIGSTRUCT_START_MARKER}\nmr_enclave: abc123\nmr_signer: def456\nisv_prod_id: 0\nisv_svn: 1\n{SIGSTRUCT_END_MARKER}"
        )
    }

    #[tokio::test]
    async fn provision_success() {
        let record = make_record(VmState::Provisioning);
        let id = record.id;
        let mut builder = Builder::default();

        builder.azure.expect_create_network_security_group().once().return_once(|_| Ok("nsg-id".into()));
        builder.azure.expect_create_public_ip().once().return_once(|_| Ok("ip-id".into()));
        builder
            .azure
            .expect_create_network_interface()
            .withf(|name, subnet, ip, nsg| {
                name == "tee-vm-12345678-nic" && subnet.contains("subnets/default") && ip == "ip-id" && nsg == "nsg-id"
            })
            .once()
            .return_once(|_, _, _, _| Ok("nic-id".into()));
        builder
            .azure
            .expect_create_vm()
            .withf(|name, nic_id, spec| {
                name == "tee-vm-12345678" && nic_id == "nic-id" && spec.size == "Standard_DC1s_v3"
            })
            .once()
            .return_once(|_, _, _| Ok(()));
        builder.azure.expect_instance_view().return_once(|_| Ok(ready_state()));
        builder.azure.expect_run_setup_script().once().return_once(|_, _| Ok(vec![sigstruct_message()]));
        builder.azure.expect_vm_public_ip().once().return_once(|_| Ok(Some("20.31.0.7".into())));

        builder
            .repository
            .expect_set_sigstruct()
            .withf(|_, sigstruct| sigstruct.mr_enclave == "abc123")
            .once()
            .return_once(|_, _| Ok(()));
        builder.repository.expect_set_public_ip().with(eq(id), eq("20.31.0.7".to_string())).once().return_once(|_, _| Ok(()));
        builder.repository.expect_update_state().with(eq(id), eq(VmState::Running)).once().return_once(|_, _| Ok(()));

        builder.build().provision(record).await;
    }

    #[tokio::test]
    async fn provision_provider_failure() {
        let record = make_record(VmState::Provisioning);
        let id = record.id;
        let mut builder = Builder::default();

        builder
            .azure
            .expect_create_network_security_group()
            .once()
            .return_once(|_| Err(AzureError::Api { status: 409, message: "QuotaExceeded: quota exceeded".into() }));
        builder
            .repository
            .expect_update_state()
            .withf(move |actual_id, state| {
                *actual_id == id && matches!(state, VmState::Failed { error } if error.contains("QuotaExceeded"))
            })
            .once()
            .return_once(|_, _| Ok(()));

        builder.build().provision(record).await;
    }

    #[tokio::test]
    async fn provision_ready_timeout() {
        let record = make_record(VmState::Provisioning);
        let id = record.id;
        let mut builder = Builder::default();
        builder.settings.provision_timeout = Duration::from_millis(5);

        builder.azure.expect_create_network_security_group().return_once(|_| Ok("nsg-id".into()));
        builder.azure.expect_create_public_ip().return_once(|_| Ok("ip-id".into()));
        builder.azure.expect_create_network_interface().return_once(|_, _, _, _| Ok("nic-id".into()));
        builder.azure.expect_create_vm().return_once(|_, _, _| Ok(()));
        builder.azure.expect_instance_view().returning(|_| {
            Ok(VmInstanceState { provisioning_state: Some("updating".into()), ..Default::default() })
        });
        builder
            .repository
            .expect_update_state()
            .withf(move |actual_id, state| {
                *actual_id == id && matches!(state, VmState::Failed { error } if error.contains("running state"))
            })
            .once()
            .return_once(|_, _| Ok(()));

        builder.build().provision(record).await;
    }

    #[tokio::test]
    async fn teardown_tolerates_missing_resources() {
        let record = make_record(VmState::Deleting);
        let id = record.id;
        let mut builder = Builder::default();

        builder.azure.expect_delete_vm().withf(|name| name == "tee-vm-12345678").once().return_once(|_| Err(AzureError::NotFound));
        builder.azure.expect_delete_network_interface().once().return_once(|_| Ok(()));
        builder.azure.expect_delete_public_ip().once().return_once(|_| Ok(()));
        builder.azure.expect_delete_network_security_group().once().return_once(|_| Ok(()));
        builder.repository.expect_update_state().with(eq(id), eq(VmState::Deleted)).once().return_once(|_, _| Ok(()));

        builder.build().teardown(record).await;
    }

    #[tokio::test]
    async fn teardown_provider_failure() {
        let record = make_record(VmState::Deleting);
        let id = record.id;
        let mut builder = Builder::default();

        builder
            .azure
            .expect_delete_vm()
            .once()
            .return_once(|_| Err(AzureError::Api { status: 500, message: "InternalError: boom".into() }));
        builder
            .repository
            .expect_update_state()
            .withf(move |actual_id, state| {
                *actual_id == id && matches!(state, VmState::Failed { error } if error.contains("InternalError"))
            })
            .once()
            .return_once(|_, _| Ok(()));

        builder.build().teardown(record).await;
    }

    #[tokio::test]
    async fn reconcile_marks_out_of_band_deletion() {
        let running = make_record(VmState::Running);
        let id = running.id;
        let provisioning = make_record(VmState::Provisioning);
        let mut builder = Builder::default();

        let records = vec![running, provisioning];
        builder.repository.expect_list().return_once(move || Ok(records));
        // Only the running record is checked against the provider.
        builder.azure.expect_instance_view().once().return_once(|_| Err(AzureError::NotFound));
        builder.repository.expect_update_state().with(eq(id), eq(VmState::Deleted)).once().return_once(|_, _| Ok(()));

        builder.build().reconcile().await.expect("reconcile failed");
    }

    #[test]
    fn sigstruct_parsing() {
        let messages = vec!["unrelated".to_string(), sigstruct_message()];
        let sigstruct = parse_sigstruct(&messages).expect("failed to parse");
        assert_eq!(sigstruct.mr_enclave, "abc123");
        assert_eq!(sigstruct.mr_signer, "def456");
        assert_eq!(sigstruct.isv_prod_id, "0");
        assert_eq!(sigstruct.isv_svn, "1");
    }

    #[test]
    fn sigstruct_parsing_incomplete() {
        let message = format!("{SIGSTRUCT_START_MARKER}\nmr_enclave: abc123\n{SIGSTRUCT_END_MARKER}");
        assert_eq!(parse_sigstruct(&[message]), None);
        assert_eq!(parse_sigstruct(&["no markers here".to_string()]), None);
    }

    #[test]
    fn setup_script_references_image() {
        let script = render_setup_script("example/ra-tls-server:v1");
        assert!(script.contains("sudo docker pull example/ra-tls-server:v1"));
        assert!(script.contains(SIGSTRUCT_START_MARKER));
    }
}
