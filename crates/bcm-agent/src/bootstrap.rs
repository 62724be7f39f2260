//! One-time node certificate bootstrap.
//!
//! A node without its own certificate uses the shared bootstrap credential
//! to run the external registration tool once. The certificate and key
//! files are the only state: if both exist the node is issued.

use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tracing::info;
use tracing::warn;

pub const DEFAULT_REGISTER_COMMAND: &str = "register_node";
const OPENSSL: &str = "openssl";

#[derive(Debug, Display)]
pub enum BootstrapError {
    #[display("Bootstrap credential not found at {}", path.display())]
    MissingBootstrapCredential { path: PathBuf },

    #[display("Failed to run registration command {command}")]
    RegisterCommand { command: String },

    #[display("Registration command {command} failed with {status}")]
    RegisterFailed { command: String, status: String },

    #[display("Registration finished but {} does not exist", path.display())]
    CertificateMissing { path: PathBuf },

    #[display("Registration finished but {} still expires soon", path.display())]
    CertificateNotRenewed { path: PathBuf },
}

impl Error for BootstrapError {}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    NoCert,
    Requesting,
    Issued,
}

/// What [`CertBootstrap::ensure_certificate`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A usable certificate was already present
    AlreadyIssued,
    /// The registration command ran and produced the certificate
    Registered,
}

#[derive(Debug, Clone)]
pub struct CertBootstrap {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub bootstrap_cert_path: PathBuf,
    pub bootstrap_key_path: PathBuf,
    pub register_command: String,
    pub register_args: Vec<String>,
    /// Re-register when the certificate expires within this window
    pub renew_before: Option<Duration>,
    openssl: String,
}

impl CertBootstrap {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        bootstrap_cert_path: impl Into<PathBuf>,
        bootstrap_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            bootstrap_cert_path: bootstrap_cert_path.into(),
            bootstrap_key_path: bootstrap_key_path.into(),
            register_command: DEFAULT_REGISTER_COMMAND.to_string(),
            register_args: Vec::new(),
            renew_before: None,
            openssl: OPENSSL.to_string(),
        }
    }

    pub fn with_register_command(
        mut self,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.register_command = command.into();
        self.register_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_renew_before(mut self, renew_before: Option<Duration>) -> Self {
        self.renew_before = renew_before;
        self
    }

    #[cfg(test)]
    fn with_openssl(mut self, program: &str) -> Self {
        self.openssl = program.to_string();
        self
    }

    /// Current state as seen on disk.
    pub async fn state(&self) -> CertState {
        if !exists(&self.cert_path).await || !exists(&self.key_path).await {
            return CertState::NoCert;
        }
        match self.renew_before {
            Some(window) if self.expires_within(window).await => {
                info!("Node certificate expires within {window:?}, renewing");
                CertState::NoCert
            }
            _ => CertState::Issued,
        }
    }

    /// Moves the node to [`CertState::Issued`], registering it if needed.
    ///
    /// The registration command runs at most once per call.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::MissingBootstrapCredential`] if registration is needed
    ///   but the bootstrap certificate or key is absent
    /// - [`BootstrapError::RegisterCommand`] if the command cannot be started
    /// - [`BootstrapError::RegisterFailed`] if it exits unsuccessfully
    /// - [`BootstrapError::CertificateMissing`] if it succeeds without
    ///   producing both files
    /// - [`BootstrapError::CertificateNotRenewed`] if a renewal left the
    ///   expiring certificate in place
    #[tracing::instrument(skip(self), fields(cert = %self.cert_path.display()))]
    pub async fn ensure_certificate(&self) -> Result<BootstrapOutcome, Report<BootstrapError>> {
        let state = self.state().await;
        if state == CertState::Issued {
            info!("Node certificate present, skipping bootstrap");
            return Ok(BootstrapOutcome::AlreadyIssued);
        }

        for path in [&self.bootstrap_cert_path, &self.bootstrap_key_path] {
            if !exists(path).await {
                return Err(Report::new(BootstrapError::MissingBootstrapCredential {
                    path: path.clone(),
                }));
            }
        }

        info!("Certificate state: {state} -> {}", CertState::Requesting);
        self.register().await?;

        for path in [&self.cert_path, &self.key_path] {
            if !exists(path).await {
                return Err(Report::new(BootstrapError::CertificateMissing {
                    path: path.clone(),
                }));
            }
        }
        if let Some(window) = self.renew_before {
            if self.expires_within(window).await {
                return Err(Report::new(BootstrapError::CertificateNotRenewed {
                    path: self.cert_path.clone(),
                }));
            }
        }

        info!(
            "Certificate state: {} -> {}",
            CertState::Requesting,
            CertState::Issued
        );
        Ok(BootstrapOutcome::Registered)
    }

    async fn register(&self) -> Result<(), Report<BootstrapError>> {
        let command = format!("{} {}", self.register_command, self.register_args.join(" "));
        info!("Registering node: {}", command.trim_end());

        let status = Command::new(&self.register_command)
            .args(&self.register_args)
            .status()
            .await
            .change_context_lazy(|| BootstrapError::RegisterCommand {
                command: self.register_command.clone(),
            })?;

        if !status.success() {
            return Err(Report::new(BootstrapError::RegisterFailed {
                command: self.register_command.clone(),
                status: status.to_string(),
            }));
        }
        Ok(())
    }

    async fn expires_within(&self, window: Duration) -> bool {
        let result = Command::new(&self.openssl)
            .arg("x509")
            .arg("-checkend")
            .arg(window.as_secs().to_string())
            .arg("-noout")
            .arg("-in")
            .arg(&self.cert_path)
            .output()
            .await;

        match result {
            Ok(output) => !output.status.success(),
            Err(e) => {
                warn!("Failed to check certificate expiry with {}: {e}", self.openssl);
                false
            }
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
