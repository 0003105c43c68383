use crate::config::AzureConfig;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::{collections::HashMap, time::Duration};
use tee_runner_models::vms::ImageReference;
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};
use tracing::{debug, info};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const COMPUTE_API_VERSION: &str = "2024-07-01";
const NETWORK_API_VERSION: &str = "2024-05-01";

// Tokens are refreshed this much before their reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const RESOURCE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RESOURCE_POLL_ATTEMPTS: u32 = 90;
const TEARDOWN_POLL_ATTEMPTS: u32 = 150;

#[derive(Error, Debug)]
pub enum AzureError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("resource not found")]
    NotFound,

    #[error("provider error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0} provisioning did not finish in time")]
    ProvisioningTimeout(&'static str),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),
}

pub type Result<T> = std::result::Result<T, AzureError>;

/// Everything needed to submit a VM create call, resolved from the request and the
/// service defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct VmProvisionSpec {
    pub size: String,
    pub image: ImageReference,
    pub admin_username: String,
    pub ssh_public_key: String,
    pub security_type: String,
    pub secure_boot: bool,
    pub vtpm: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub properties: VirtualMachineProperties,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    #[serde(default)]
    pub hardware_profile: Option<HardwareProfile>,
    #[serde(default)]
    pub storage_profile: Option<StorageProfile>,
    #[serde(default)]
    pub network_profile: Option<NetworkProfile>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    pub vm_size: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfile {
    pub os_disk: Option<OsDisk>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsDisk {
    pub os_type: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    #[serde(default)]
    pub network_interfaces: Vec<SubResource>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubResource {
    pub id: String,
}

/// Condensed provider-reported VM status, derived from the instance view.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmInstanceState {
    pub provisioning_state: Option<String>,
    pub power_state: Option<String>,
    pub display_status: Option<String>,
}

impl VmInstanceState {
    /// The VM is fully allocated and powered on.
    pub fn is_ready(&self) -> bool {
        self.provisioning_state.as_deref() == Some("succeeded") && self.power_state.as_deref() == Some("running")
    }
}

impl From<InstanceView> for VmInstanceState {
    fn from(view: InstanceView) -> Self {
        let mut state = VmInstanceState::default();
        for status in &view.statuses {
            let Some(code) = &status.code else {
                continue;
            };
            if let Some(suffix) = code.strip_prefix("ProvisioningState/") {
                state.provisioning_state = Some(suffix.into());
            } else if let Some(suffix) = code.strip_prefix("PowerState/") {
                state.power_state = Some(suffix.into());
            }
        }
        // The last status is usually the most relevant one for display purposes.
        state.display_status = view.statuses.iter().rev().find_map(|s| s.display_status.clone());
        state
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InstanceView {
    #[serde(default)]
    pub statuses: Vec<InstanceViewStatus>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceViewStatus {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub display_status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A client for the subset of the Azure Resource Manager API used by the lifecycle
/// manager. All operations are scoped to the configured resource group.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AzureClient: Send + Sync {
    /// Create an NSG allowing inbound SSH and HTTPS, returning its resource id.
    async fn create_network_security_group(&self, name: &str) -> Result<String>;

    /// Create a static public IPv4 address, returning its resource id.
    async fn create_public_ip(&self, name: &str) -> Result<String>;

    /// Create a NIC bound to the given subnet, public IP and NSG, returning its resource id.
    async fn create_network_interface(
        &self,
        name: &str,
        subnet_id: &str,
        public_ip_id: &str,
        nsg_id: &str,
    ) -> Result<String>;

    /// Submit the VM create call. Provisioning continues provider-side after this returns.
    async fn create_vm(&self, name: &str, nic_id: &str, spec: &VmProvisionSpec) -> Result<()>;

    async fn get_vm(&self, name: &str) -> Result<VirtualMachine>;

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>>;

    async fn instance_view(&self, name: &str) -> Result<VmInstanceState>;

    /// Resolve the public IP address attached to a VM's primary NIC, if any.
    async fn vm_public_ip(&self, name: &str) -> Result<Option<String>>;

    /// Run a script on the VM through the custom-script extension and return the
    /// status messages from the extension's instance view.
    async fn run_setup_script(&self, vm_name: &str, script: &str) -> Result<Vec<String>>;

    /// Delete the VM and wait for the provider to confirm the teardown.
    async fn delete_vm(&self, name: &str) -> Result<()>;

    async fn delete_network_interface(&self, name: &str) -> Result<()>;

    async fn delete_public_ip(&self, name: &str) -> Result<()>;

    async fn delete_network_security_group(&self, name: &str) -> Result<()>;
}

pub struct ArmAzureClient {
    client: Client,
    management_url: String,
    login_url: String,
    config: AzureConfig,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ArmErrorBody {
    error: Option<ArmErrorDetail>,
}

#[derive(Deserialize)]
struct ArmErrorDetail {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct ResourceList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize)]
struct CreatedResource {
    id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionableProperties {
    provisioning_state: Option<String>,
}

#[derive(Deserialize)]
struct ProvisionableResource {
    #[serde(default)]
    properties: ProvisionableProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    properties: NetworkInterfaceProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceProperties {
    #[serde(default)]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Deserialize)]
struct IpConfiguration {
    #[serde(default)]
    properties: IpConfigurationProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpConfigurationProperties {
    public_ip_address: Option<SubResource>,
}

#[derive(Deserialize)]
struct PublicIpAddress {
    #[serde(default)]
    properties: PublicIpAddressProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIpAddressProperties {
    ip_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmExtension {
    #[serde(default)]
    properties: VmExtensionProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmExtensionProperties {
    provisioning_state: Option<String>,
    instance_view: Option<InstanceView>,
}

impl ArmAzureClient {
    pub fn new(config: AzureConfig) -> anyhow::Result<Self> {
        Self::with_endpoints(config, MANAGEMENT_ENDPOINT, LOGIN_ENDPOINT)
    }

    pub fn with_endpoints(config: AzureConfig, management_url: &str, login_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build reqwest client: {e}"))?;
        Ok(Self {
            client,
            management_url: management_url.into(),
            login_url: login_url.into(),
            config,
            token: Mutex::default(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }
        let url = format!("{}/{}/oauth2/v2.0/token", self.login_url, self.config.tenant_id);
        debug!("Requesting management token for client {}", self.config.client_id);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("scope", MANAGEMENT_SCOPE),
        ];
        let response = self.client.post(&url).form(&params).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AzureError::Auth(body));
        }
        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *guard = Some(CachedToken { token: token.access_token.clone(), expires_at: Instant::now() + lifetime });
        Ok(token.access_token)
    }

    fn network_url(&self, resource_type: &str, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/{resource_type}/{name}?api-version={NETWORK_API_VERSION}",
            self.management_url, self.config.subscription_id, self.config.resource_group
        )
    }

    fn compute_url(&self, suffix: &str, query: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/{suffix}?api-version={COMPUTE_API_VERSION}{query}",
            self.management_url, self.config.subscription_id, self.config.resource_group
        )
    }

    async fn request(&self, method: Method, url: &str, body: Option<&serde_json::Value>) -> Result<Response> {
        let token = self.access_token().await?;
        let mut request: RequestBuilder = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        if response.status().is_success() { Ok(response) } else { Err(Self::error_from_response(response).await) }
    }

    async fn error_from_response(response: Response) -> AzureError {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return AzureError::NotFound;
        }
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ArmErrorBody>(&body) {
            Ok(ArmErrorBody { error: Some(detail) }) => format!("{}: {}", detail.code, detail.message),
            _ => body,
        };
        AzureError::Api { status: status.as_u16(), message }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.request(Method::GET, url, None).await?;
        Ok(response.json().await?)
    }

    async fn put_json<T: DeserializeOwned>(&self, url: &str, body: &serde_json::Value) -> Result<T> {
        let response = self.request(Method::PUT, url, Some(body)).await?;
        Ok(response.json().await?)
    }

    /// Poll a network resource until the provider reports its provisioning finished.
    async fn wait_network_provisioned(&self, resource_type: &'static str, name: &str) -> Result<()> {
        for _ in 0..RESOURCE_POLL_ATTEMPTS {
            let url = self.network_url(resource_type, name);
            let resource: ProvisionableResource = self.get_json(&url).await?;
            match resource.properties.provisioning_state.as_deref() {
                Some("Succeeded") => return Ok(()),
                Some("Failed") => {
                    return Err(AzureError::ProvisioningFailed(format!("{resource_type}/{name}")));
                }
                state => debug!("{resource_type}/{name} is still provisioning (state: {state:?})"),
            }
            sleep(RESOURCE_POLL_INTERVAL).await;
        }
        Err(AzureError::ProvisioningTimeout(resource_type))
    }

    /// Delete a resource and wait until the provider stops reporting it.
    async fn delete_and_confirm(&self, url: &str) -> Result<()> {
        self.request(Method::DELETE, url, None).await?;
        for _ in 0..TEARDOWN_POLL_ATTEMPTS {
            match self.request(Method::GET, url, None).await {
                Err(AzureError::NotFound) => return Ok(()),
                Err(e) => return Err(e),
                Ok(_) => sleep(RESOURCE_POLL_INTERVAL).await,
            }
        }
        Err(AzureError::ProvisioningTimeout("resource deletion"))
    }

    fn resource_name(id: &str) -> &str {
        id.rsplit('/').next().unwrap_or(id)
    }
}

#[async_trait]
impl AzureClient for ArmAzureClient {
    async fn create_network_security_group(&self, name: &str) -> Result<String> {
        info!("Creating network security group {name}");
        let body = json!({
            "location": self.config.location,
            "properties": {
                "securityRules": [
                    {
                        "name": "AllowSSH",
                        "properties": {
                            "priority": 100,
                            "direction": "Inbound",
                            "access": "Allow",
                            "protocol": "Tcp",
                            "sourcePortRange": "*",
                            "destinationPortRange": "22",
                            "sourceAddressPrefix": "*",
                            "destinationAddressPrefix": "*"
                        }
                    },
                    {
                        "name": "AllowAnyHTTPSInbound",
                        "properties": {
                            "priority": 110,
                            "direction": "Inbound",
                            "access": "Allow",
                            "protocol": "Tcp",
                            "sourcePortRange": "*",
                            "destinationPortRange": "443",
                            "sourceAddressPrefix": "*",
                            "destinationAddressPrefix": "*"
                        }
                    }
                ]
            }
        });
        let url = self.network_url("networkSecurityGroups", name);
        let created: CreatedResource = self.put_json(&url, &body).await?;
        self.wait_network_provisioned("networkSecurityGroups", name).await?;
        Ok(created.id)
    }

    async fn create_public_ip(&self, name: &str) -> Result<String> {
        info!("Creating public IP {name}");
        let body = json!({
            "location": self.config.location,
            "sku": { "name": "Standard" },
            "properties": {
                "publicIPAllocationMethod": "Static",
                "publicIPAddressVersion": "IPv4"
            }
        });
        let url = self.network_url("publicIPAddresses", name);
        let created: CreatedResource = self.put_json(&url, &body).await?;
        self.wait_network_provisioned("publicIPAddresses", name).await?;
        Ok(created.id)
    }

    async fn create_network_interface(
        &self,
        name: &str,
        subnet_id: &str,
        public_ip_id: &str,
        nsg_id: &str,
    ) -> Result<String> {
        info!("Creating network interface {name}");
        let body = json!({
            "location": self.config.location,
            "properties": {
                "ipConfigurations": [
                    {
                        "name": format!("{name}-ipconfig"),
                        "properties": {
                            "subnet": { "id": subnet_id },
                            "publicIPAddress": { "id": public_ip_id }
                        }
                    }
                ],
                "networkSecurityGroup": { "id": nsg_id }
            }
        });
        let url = self.network_url("networkInterfaces", name);
        let created: CreatedResource = self.put_json(&url, &body).await?;
        self.wait_network_provisioned("networkInterfaces", name).await?;
        Ok(created.id)
    }

    async fn create_vm(&self, name: &str, nic_id: &str, spec: &VmProvisionSpec) -> Result<()> {
        info!("Submitting create call for VM {name}");
        let VmProvisionSpec { size, image, admin_username, ssh_public_key, security_type, secure_boot, vtpm } = spec;
        let body = json!({
            "location": self.config.location,
            "properties": {
                "hardwareProfile": { "vmSize": size },
                "storageProfile": {
                    "imageReference": {
                        "publisher": image.publisher,
                        "offer": image.offer,
                        "sku": image.sku,
                        "version": image.version
                    },
                    "osDisk": {
                        "createOption": "FromImage",
                        "managedDisk": { "storageAccountType": "StandardSSD_LRS" }
                    }
                },
                "networkProfile": {
                    "networkInterfaces": [
                        {
                            "id": nic_id,
                            "properties": { "deleteOption": "Delete" }
                        }
                    ]
                },
                "osProfile": {
                    "computerName": name,
                    "adminUsername": admin_username,
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": true,
                        "ssh": {
                            "publicKeys": [
                                {
                                    "path": format!("/home/{admin_username}/.ssh/authorized_keys"),
                                    "keyData": ssh_public_key
                                }
                            ]
                        }
                    }
                },
                "securityProfile": {
                    "uefiSettings": {
                        "secureBootEnabled": secure_boot,
                        "vTpmEnabled": vtpm
                    },
                    "securityType": security_type
                }
            }
        });
        let url = self.compute_url(&format!("virtualMachines/{name}"), "");
        self.request(Method::PUT, &url, Some(&body)).await?;
        Ok(())
    }

    async fn get_vm(&self, name: &str) -> Result<VirtualMachine> {
        let url = self.compute_url(&format!("virtualMachines/{name}"), "");
        self.get_json(&url).await
    }

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        debug!("Listing VMs in resource group {}", self.config.resource_group);
        let url = self.compute_url("virtualMachines", "");
        let list: ResourceList<VirtualMachine> = self.get_json(&url).await?;
        Ok(list.value)
    }

    async fn instance_view(&self, name: &str) -> Result<VmInstanceState> {
        let url = self.compute_url(&format!("virtualMachines/{name}/instanceView"), "");
        let view: InstanceView = self.get_json(&url).await?;
        Ok(view.into())
    }

    async fn vm_public_ip(&self, name: &str) -> Result<Option<String>> {
        let vm = self.get_vm(name).await?;
        let Some(nic_ref) = vm.properties.network_profile.and_then(|p| p.network_interfaces.into_iter().next())
        else {
            return Ok(None);
        };
        let nic_url = self.network_url("networkInterfaces", Self::resource_name(&nic_ref.id));
        let nic: NetworkInterface = self.get_json(&nic_url).await?;
        let Some(ip_ref) =
            nic.properties.ip_configurations.into_iter().next().and_then(|c| c.properties.public_ip_address)
        else {
            return Ok(None);
        };
        let ip_url = self.network_url("publicIPAddresses", Self::resource_name(&ip_ref.id));
        let ip: PublicIpAddress = self.get_json(&ip_url).await?;
        Ok(ip.properties.ip_address)
    }

    async fn run_setup_script(&self, vm_name: &str, script: &str) -> Result<Vec<String>> {
        let extension_name = format!("{vm_name}-setup-script");
        info!("Deploying custom script extension {extension_name}");
        let encoded = base64::engine::general_purpose::STANDARD.encode(script);
        let body = json!({
            "location": self.config.location,
            "properties": {
                "publisher": "Microsoft.Azure.Extensions",
                "type": "CustomScript",
                "typeHandlerVersion": "2.1",
                "autoUpgradeMinorVersion": true,
                "settings": { "script": encoded },
                "protectedSettings": {}
            }
        });
        let url = self.compute_url(&format!("virtualMachines/{vm_name}/extensions/{extension_name}"), "");
        self.request(Method::PUT, &url, Some(&body)).await?;

        let expanded_url = self.compute_url(
            &format!("virtualMachines/{vm_name}/extensions/{extension_name}"),
            "&$expand=instanceView",
        );
        for _ in 0..RESOURCE_POLL_ATTEMPTS {
            let extension: VmExtension = self.get_json(&expanded_url).await?;
            match extension.properties.provisioning_state.as_deref() {
                Some("Succeeded") => {
                    let statuses = extension.properties.instance_view.unwrap_or_default().statuses;
                    return Ok(statuses.into_iter().filter_map(|s| s.message).collect());
                }
                Some("Failed") => {
                    return Err(AzureError::ProvisioningFailed(format!("extension {extension_name}")));
                }
                state => debug!("Extension {extension_name} is still running (state: {state:?})"),
            }
            sleep(RESOURCE_POLL_INTERVAL).await;
        }
        Err(AzureError::ProvisioningTimeout("custom script extension"))
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        info!("Deleting VM {name}");
        let url = self.compute_url(&format!("virtualMachines/{name}"), "");
        self.delete_and_confirm(&url).await
    }

    async fn delete_network_interface(&self, name: &str) -> Result<()> {
        info!("Deleting network interface {name}");
        let url = self.network_url("networkInterfaces", name);
        self.delete_and_confirm(&url).await
    }

    async fn delete_public_ip(&self, name: &str) -> Result<()> {
        info!("Deleting public IP {name}");
        let url = self.network_url("publicIPAddresses", name);
        self.delete_and_confirm(&url).await
    }

    async fn delete_network_security_group(&self, name: &str) -> Result<()> {
        info!("Deleting network security group {name}");
        let url = self.network_url("networkSecurityGroups", name);
        self.delete_and_confirm(&url).await
    }
}
