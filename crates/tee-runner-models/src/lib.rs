use chrono::{DateTime, Utc};
use convert_case::{Case, Casing};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use uuid::Uuid;
use validator::Validate;

pub mod vms {
    use super::*;

    /// The lifecycle state of a deployed VM.
    ///
    /// The provider is authoritative: transitions only happen when the provider accepts a
    /// submission or reports the corresponding change.
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "kebab-case", tag = "state")]
    pub enum VmState {
        Requested,
        Provisioning,
        Running,
        Deleting,
        Deleted,
        Failed { error: String },
    }

    impl VmState {
        /// Whether moving to `next` is a legal lifecycle transition.
        pub fn can_transition_to(&self, next: &VmState) -> bool {
            use VmState::*;
            matches!(
                (self, next),
                (Requested, Provisioning)
                    | (Requested, Failed { .. })
                    | (Provisioning, Running)
                    | (Provisioning, Failed { .. })
                    | (Running, Deleting)
                    | (Running, Deleted)
                    | (Failed { .. }, Deleting)
                    | (Deleting, Deleted)
                    | (Deleting, Failed { .. })
            )
        }

        /// Whether the underlying provider operation has finished, successfully or not.
        pub fn is_settled(&self) -> bool {
            matches!(self, Self::Running | Self::Deleted | Self::Failed { .. })
        }
    }

    impl fmt::Display for VmState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                Self::Requested => "requested",
                Self::Provisioning => "provisioning",
                Self::Running => "running",
                Self::Deleting => "deleting",
                Self::Deleted => "deleted",
                Self::Failed { .. } => "failed",
            };
            write!(f, "{name}")
        }
    }

    /// An Azure marketplace image reference.
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct ImageReference {
        pub publisher: String,
        pub offer: String,
        pub sku: String,
        pub version: String,
    }

    /// Enclave identity extracted from the signed SGX sigstruct on the deployed VM.
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct SigstructData {
        pub mr_enclave: String,
        pub mr_signer: String,
        pub isv_prod_id: String,
        pub isv_svn: String,
    }

    pub mod create {
        use super::*;

        pub(crate) static VM_NAME_REGEX: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,30}$").unwrap());
        pub(crate) static VM_SIZE_REGEX: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]+$").unwrap());
        pub(crate) static SECURITY_TYPE_REGEX: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^[A-Za-z]+$").unwrap());

        #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
        #[serde(rename_all = "camelCase")]
        pub struct CreateVmRequest {
            /// Prefix for the VM name; a short request id is appended for uniqueness.
            #[validate(regex(path = VM_NAME_REGEX))]
            pub name: String,

            /// VM size; falls back to the service default when omitted.
            #[validate(regex(path = VM_SIZE_REGEX))]
            #[serde(default)]
            pub size: Option<String>,

            /// Image reference; falls back to the service default when omitted.
            #[serde(default)]
            pub image: Option<ImageReference>,

            /// Security profile type, e.g. TrustedLaunch or ConfidentialVM; falls back
            /// to the service default when omitted.
            #[validate(regex(path = SECURITY_TYPE_REGEX))]
            #[serde(default)]
            pub security_type: Option<String>,
        }

        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct CreateVmResponse {
            pub id: Uuid,
            pub vm_name: String,
            #[serde(flatten)]
            pub state: VmState,
            pub created_at: DateTime<Utc>,
        }
    }

    pub mod get {
        use super::*;

        /// The full status of a deployment tracked by this service.
        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct VmDeployment {
            pub id: Uuid,
            pub vm_name: String,
            #[serde(flatten)]
            pub state: VmState,
            pub size: String,
            pub security_type: String,
            pub location: String,
            pub resource_group: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            pub public_ip: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            pub sigstruct: Option<SigstructData>,
            pub created_at: DateTime<Utc>,
            #[serde(skip_serializing_if = "Option::is_none")]
            pub finished_at: Option<DateTime<Utc>>,
        }
    }

    pub mod list {
        use super::*;

        /// A provider-reported VM in the managed resource group.
        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct VmSummary {
            pub name: String,
            pub status: String,
            pub size: String,
            pub location: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            pub os_type: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            pub public_ip: Option<String>,
            #[serde(default)]
            pub tags: HashMap<String, String>,
        }
    }
}

pub mod attestation {
    use super::*;

    static MEASUREMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").unwrap());
    static SVN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{1,5}$").unwrap());

    fn default_port() -> u16 {
        443
    }

    fn default_svn() -> String {
        "0".into()
    }

    /// A request to run the RA-TLS attestation handshake against a deployed VM.
    #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
    #[serde(rename_all = "camelCase")]
    pub struct AttestationRequest {
        pub vm_name: String,

        /// Expected MRENCLAVE measurement, hex encoded.
        #[validate(regex(path = MEASUREMENT_REGEX))]
        pub mrenclave: String,

        /// Expected MRSIGNER measurement, hex encoded.
        #[validate(regex(path = MEASUREMENT_REGEX))]
        pub mrsigner: String,

        /// Port to connect to for the handshake.
        #[serde(default = "default_port")]
        pub port: u16,

        #[validate(regex(path = SVN_REGEX))]
        #[serde(default = "default_svn")]
        pub isv_prod_id: String,

        #[validate(regex(path = SVN_REGEX))]
        #[serde(default = "default_svn")]
        pub isv_svn: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AttestationResponse {
        pub success: bool,
        pub vm_name: String,
        pub host: String,
        pub details: AttestationDetails,
        pub timestamp: DateTime<Utc>,
    }

    /// Relayed output of the attestation helper; never persisted.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AttestationDetails {
        pub stdout: String,
        pub stderr: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub exit_code: Option<i32>,
        pub duration_seconds: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }
}

pub mod errors {
    use super::*;

    /// An error when handling a request.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RequestHandlerError {
        /// A descriptive message about the error that was encountered.
        pub message: String,

        /// The error code.
        pub error_code: String,
    }

    impl RequestHandlerError {
        pub fn new(message: impl Into<String>, error_code: impl AsRef<str>) -> Self {
            let error_code = error_code.as_ref().to_case(Case::UpperSnake);
            Self { message: message.into(), error_code }
        }
    }
}
