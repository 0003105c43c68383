use crate::config::AttestationConfig;
use async_trait::async_trait;
use std::{io, process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::info;

#[derive(Error, Debug)]
pub enum QuoteRunnerError {
    #[error("attestation helper not found at {0}")]
    BinaryMissing(String),

    #[error("attestation helper timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to run attestation helper: {0}")]
    Io(#[from] io::Error),
}

/// The endpoint the helper connects to for the RA-TLS handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct QuoteTarget {
    pub host: String,
    pub port: u16,
}

/// The enclave measurements the helper verifies the peer against.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurements {
    pub mrenclave: String,
    pub mrsigner: String,
    pub isv_prod_id: String,
    pub isv_svn: String,
}

/// Raw output of a single helper invocation.
#[derive(Clone, Debug)]
pub struct QuoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl QuoteOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the external attestation helper. The handshake itself is entirely the helper's
/// business; we only invoke it and relay its output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteRunner: Send + Sync {
    async fn fetch_quote(
        &self,
        target: &QuoteTarget,
        measurements: &Measurements,
    ) -> Result<QuoteOutput, QuoteRunnerError>;
}

pub struct BinaryQuoteRunner {
    config: AttestationConfig,
}

impl BinaryQuoteRunner {
    pub fn new(config: AttestationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QuoteRunner for BinaryQuoteRunner {
    async fn fetch_quote(
        &self,
        target: &QuoteTarget,
        measurements: &Measurements,
    ) -> Result<QuoteOutput, QuoteRunnerError> {
        let binary_path = &self.config.binary_path;
        if !binary_path.exists() {
            return Err(QuoteRunnerError::BinaryMissing(binary_path.display().to_string()));
        }

        let QuoteTarget { host, port } = target;
        let Measurements { mrenclave, mrsigner, isv_prod_id, isv_svn } = measurements;
        info!("Running attestation for {host}:{port} with measurements {mrenclave}, {mrsigner}");

        let mut command = Command::new(binary_path);
        command
            .args(["dcap", mrenclave, mrsigner, isv_prod_id, isv_svn])
            .env("APPLICATION_HOST", host)
            .env("APPLICATION_PORT", port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the output future on timeout must not leave the helper behind.
            .kill_on_drop(true);
        if self.config.allow_debug_enclave {
            command.env("RA_TLS_ALLOW_DEBUG_ENCLAVE_INSECURE", "1");
        }
        if self.config.allow_outdated_tcb {
            command.env("RA_TLS_ALLOW_OUTDATED_TCB_INSECURE", "1");
        }

        let started = std::time::Instant::now();
        let output = match timeout(self.config.timeout, command.output()).await {
            Ok(output) => output?,
            Err(_) => return Err(QuoteRunnerError::Timeout(self.config.timeout)),
        };
        Ok(QuoteOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_helper(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("attest");
        std::fs::write(&path, contents).expect("failed to write helper");
        let mut permissions = std::fs::metadata(&path).expect("failed to stat helper").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("failed to chmod helper");
        path
    }

    fn make_config(binary_path: std::path::PathBuf, timeout: Duration) -> AttestationConfig {
        AttestationConfig { binary_path, timeout, ..Default::default() }
    }

    fn make_target() -> QuoteTarget {
        QuoteTarget { host: "10.0.0.4".into(), port: 443 }
    }

    fn make_measurements() -> Measurements {
        Measurements {
            mrenclave: "aa".repeat(32),
            mrsigner: "bb".repeat(32),
            isv_prod_id: "0".into(),
            isv_svn: "0".into(),
        }
    }

    #[tokio::test]
    async fn missing_binary() {
        let runner = BinaryQuoteRunner::new(make_config("/does/not/exist".into(), Duration::from_secs(1)));
        let err = runner.fetch_quote(&make_target(), &make_measurements()).await.expect_err("run succeeded");
        assert!(matches!(err, QuoteRunnerError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn helper_output_is_relayed() {
        let dir = TempDir::new().expect("failed to create tempdir");
        let path = write_helper(dir.path(), "#!/bin/sh\necho \"mode: $1 host: $APPLICATION_HOST\"\nexit 0\n");
        let runner = BinaryQuoteRunner::new(make_config(path, Duration::from_secs(5)));

        let output = runner.fetch_quote(&make_target(), &make_measurements()).await.expect("run failed");
        assert!(output.succeeded());
        assert_eq!(output.stdout, "mode: dcap host: 10.0.0.4\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_relayed() {
        let dir = TempDir::new().expect("failed to create tempdir");
        let path = write_helper(dir.path(), "#!/bin/sh\necho oops >&2\nexit 3\n");
        let runner = BinaryQuoteRunner::new(make_config(path, Duration::from_secs(5)));

        let output = runner.fetch_quote(&make_target(), &make_measurements()).await.expect("run failed");
        assert!(!output.succeeded());
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn hung_helper_times_out() {
        let dir = TempDir::new().expect("failed to create tempdir");
        let path = write_helper(dir.path(), "#!/bin/sh\nsleep 30\n");
        let runner = BinaryQuoteRunner::new(make_config(path, Duration::from_millis(200)));

        let started = std::time::Instant::now();
        let err = runner.fetch_quote(&make_target(), &make_measurements()).await.expect_err("run succeeded");
        assert!(matches!(err, QuoteRunnerError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5), "timeout was not enforced");
    }
}
