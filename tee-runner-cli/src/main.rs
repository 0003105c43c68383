use crate::api::{ApiClient, RequestError};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tee_runner_models::{
    attestation::AttestationRequest,
    vms::{ImageReference, create::CreateVmRequest},
};
use uuid::Uuid;

mod api;

#[derive(Parser)]
struct Cli {
    /// The endpoint where tee-runner-api is reachable.
    #[clap(long, env = "TEE_RUNNER_API_URL")]
    url: String,

    /// The bearer token to use, if the API requires one.
    #[clap(long, env = "TEE_RUNNER_API_TOKEN")]
    token: Option<String>,

    /// The command to execute.
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage TEE VMs.
    #[clap(subcommand)]
    Vms(VmsCommand),

    /// Run remote attestation against a deployed VM.
    Attest(AttestArgs),
}

#[derive(Subcommand)]
enum VmsCommand {
    /// Deploy a new TEE VM.
    Create(CreateVmArgs),

    /// List the VMs in the managed resource group.
    List,

    /// Get a deployment by id.
    Get {
        /// The deployment id.
        id: Uuid,
    },

    /// Delete a deployment and its VM.
    Delete {
        /// The deployment id.
        id: Uuid,
    },
}

#[derive(Args)]
struct CreateVmArgs {
    /// Prefix for the VM name.
    name: String,

    /// VM size, e.g. Standard_DC1s_v3.
    #[clap(long)]
    size: Option<String>,

    /// Security profile type, e.g. TrustedLaunch or ConfidentialVM.
    #[clap(long)]
    security_type: Option<String>,

    /// Image publisher; all four image flags must be given together.
    #[clap(long, requires_all = ["image_offer", "image_sku", "image_version"])]
    image_publisher: Option<String>,

    #[clap(long, requires = "image_publisher")]
    image_offer: Option<String>,

    #[clap(long, requires = "image_publisher")]
    image_sku: Option<String>,

    #[clap(long, requires = "image_publisher")]
    image_version: Option<String>,
}

#[derive(Args)]
struct AttestArgs {
    /// The name of the VM to attest.
    vm_name: String,

    /// Expected MRENCLAVE measurement, hex encoded.
    mrenclave: String,

    /// Expected MRSIGNER measurement, hex encoded.
    mrsigner: String,

    /// Port to connect to for the handshake.
    #[clap(long, default_value_t = 443)]
    port: u16,

    #[clap(long, default_value = "0")]
    isv_prod_id: String,

    #[clap(long, default_value = "0")]
    isv_svn: String,
}

struct Runner {
    client: ApiClient,
}

impl Runner {
    fn new(url: String, token: Option<String>) -> Self {
        Self { client: ApiClient::new(url, token) }
    }

    fn create_vm(&self, args: CreateVmArgs) -> Result<serde_json::Value, RequestError> {
        let CreateVmArgs { name, size, security_type, image_publisher, image_offer, image_sku, image_version } = args;
        let image = match (image_publisher, image_offer, image_sku, image_version) {
            (Some(publisher), Some(offer), Some(sku), Some(version)) => {
                Some(ImageReference { publisher, offer, sku, version })
            }
            _ => None,
        };
        let request = CreateVmRequest { name, size, image, security_type };
        self.client.post("/api/v1/vms", &request)
    }

    fn list_vms(&self) -> Result<serde_json::Value, RequestError> {
        self.client.get("/api/v1/vms")
    }

    fn get_vm(&self, id: Uuid) -> Result<serde_json::Value, RequestError> {
        self.client.get(&format!("/api/v1/vms/{id}"))
    }

    fn delete_vm(&self, id: Uuid) -> Result<serde_json::Value, RequestError> {
        self.client.delete(&format!("/api/v1/vms/{id}"))
    }

    fn attest(&self, args: AttestArgs) -> Result<serde_json::Value, RequestError> {
        let AttestArgs { vm_name, mrenclave, mrsigner, port, isv_prod_id, isv_svn } = args;
        let request = AttestationRequest { vm_name, mrenclave, mrsigner, port, isv_prod_id, isv_svn };
        self.client.post("/api/v1/attestation", &request)
    }
}

fn main() {
    let cli = Cli::parse();
    let runner = Runner::new(cli.url, cli.token);
    let result = match cli.command {
        Command::Vms(VmsCommand::Create(args)) => runner.create_vm(args),
        Command::Vms(VmsCommand::List) => runner.list_vms(),
        Command::Vms(VmsCommand::Get { id }) => runner.get_vm(id),
        Command::Vms(VmsCommand::Delete { id }) => runner.delete_vm(id),
        Command::Attest(args) => runner.attest(args),
    };
    let result = match result {
        Ok(response) => response,
        Err(e) => json!({"error": e.to_string()}),
    };
    let output = serde_json::to_string(&result).expect("failed to serialize");
    println!("{output}");
}
