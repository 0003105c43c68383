use anyhow::Context;
use serde::Deserialize;
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    time::Duration,
};
use tee_runner_models::vms::ImageReference;

/// Service configuration, collected once at startup and passed down to components.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Azure subscription and credential configuration.
    pub azure: AzureConfig,

    /// Defaults and timings for deployed VMs.
    pub vm: VmConfig,

    #[serde(default)]
    pub attestation: AttestationConfig,
}

impl Config {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Environment::with_prefix("APP").separator("__"));
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder.build().context("parsing config")?;
        settings.try_deserialize().context("deserializing config")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_endpoint")]
    pub bind_endpoint: SocketAddr,

    /// Bearer token protecting the API; the API is open when unset.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Endpoint for the prometheus exporter; disabled when unset.
    #[serde(default)]
    pub metrics_bind_endpoint: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_endpoint: default_bind_endpoint(), api_token: None, metrics_bind_endpoint: None }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AzureConfig {
    pub subscription_id: String,
    pub resource_group: String,
    #[serde(default = "default_location")]
    pub location: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,

    /// Virtual network hosting the deployed VMs.
    pub vnet_name: String,
    pub subnet_name: String,
}

impl AzureConfig {
    /// The fully qualified id of the subnet new NICs are attached to.
    pub fn subnet_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
            self.subscription_id, self.resource_group, self.vnet_name, self.subnet_name
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct VmConfig {
    #[serde(default = "default_vm_size")]
    pub size: String,

    #[serde(default = "default_image")]
    pub image: ImageReference,

    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    /// SSH public key installed for the admin user; password login is disabled.
    pub ssh_public_key: String,

    #[serde(default = "default_security_type")]
    pub security_type: String,

    /// Container image the setup script deploys on new VMs.
    #[serde(default = "default_container_image")]
    pub container_image: String,

    #[serde(default = "default_true")]
    pub secure_boot: bool,

    #[serde(default = "default_true")]
    pub vtpm: bool,

    /// How long to wait for a VM to reach the running state.
    #[serde(with = "humantime_serde", default = "default_provision_timeout")]
    pub provision_timeout: Duration,

    /// Interval between provider status polls while provisioning.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Interval for the periodic provider-state reconciliation.
    #[serde(with = "humantime_serde", default = "default_watch_interval")]
    pub watch_interval: Duration,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AttestationConfig {
    #[serde(default = "default_attest_binary")]
    pub binary_path: PathBuf,

    /// Hard cap on a single helper invocation.
    #[serde(with = "humantime_serde", default = "default_attest_timeout")]
    pub timeout: Duration,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// Pass-through flag for the RA-TLS verification stack.
    #[serde(default)]
    pub allow_debug_enclave: bool,

    /// Pass-through flag for the RA-TLS verification stack.
    #[serde(default)]
    pub allow_outdated_tcb: bool,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            binary_path: default_attest_binary(),
            timeout: default_attest_timeout(),
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
            allow_debug_enclave: false,
            allow_outdated_tcb: false,
        }
    }
}

fn default_bind_endpoint() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8000))
}

fn default_location() -> String {
    "westeurope".into()
}

fn default_vm_size() -> String {
    "Standard_DC1s_v3".into()
}

fn default_image() -> ImageReference {
    ImageReference {
        publisher: "canonical".into(),
        offer: "0001-com-ubuntu-minimal-focal".into(),
        sku: "minimal-20_04-lts-gen2".into(),
        version: "latest".into(),
    }
}

fn default_admin_username() -> String {
    "azureuser".into()
}

fn default_security_type() -> String {
    "TrustedLaunch".into()
}

fn default_container_image() -> String {
    "binglekruger/ntls-ntc:v2".into()
}

fn default_true() -> bool {
    true
}

fn default_provision_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_watch_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_attest_binary() -> PathBuf {
    "/usr/local/bin/attest".into()
}

fn default_attest_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}
