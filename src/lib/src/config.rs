//! Provisioning configuration.
//!
//! Everything deployment-specific is externally supplied: the CA authority
//! reference, certificate validity, signing algorithm selection, the SKU
//! policy name, the account/region the policy template scopes to, and the
//! issuance backend. Values come from `CERTBRIDGE_*` environment variables
//! or are assembled programmatically with the builder methods.

use std::env;

use crate::ca::{PollPolicy, SigningAlgorithm};
use crate::error::CbError;

pub const ENV_CA_ARN: &str = "CERTBRIDGE_CA_ARN";
pub const ENV_VALIDITY_DAYS: &str = "CERTBRIDGE_CERT_VALIDITY_DAYS";
pub const ENV_SIGNING_ALGORITHM: &str = "CERTBRIDGE_SIGNING_ALGORITHM";
pub const ENV_POLICY_NAME: &str = "CERTBRIDGE_POLICY_NAME";
pub const ENV_REGION: &str = "CERTBRIDGE_REGION";
pub const ENV_ACCOUNT_ID: &str = "CERTBRIDGE_ACCOUNT_ID";
pub const ENV_ISSUER_BACKEND: &str = "CERTBRIDGE_ISSUER_BACKEND";
pub const ENV_ALLOWED_PATHS: &str = "CERTBRIDGE_ALLOWED_PATHS";

/// Default certificate validity when none is configured.
const DEFAULT_VALIDITY_DAYS: u32 = 150;

/// Which collaborator signs CSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerBackend {
    /// A managed CA signs asynchronously; the signed certificate is then
    /// imported into the registry as a separate step.
    ManagedCa,
    /// The device registry signs directly and activates on creation.
    Registry,
}

impl IssuerBackend {
    pub fn parse(name: &str) -> Result<Self, CbError> {
        match name.to_ascii_lowercase().as_str() {
            "managed-ca" | "managed_ca" | "ca" => Ok(IssuerBackend::ManagedCa),
            "registry" => Ok(IssuerBackend::Registry),
            other => Err(CbError::ConfigError(format!(
                "unrecognized issuer backend [{}]",
                other
            ))),
        }
    }
}

/// Workflow configuration for both entry points.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Reference to the signing authority (required for the managed CA
    /// backend).
    pub authority_ref: String,
    /// Validity requested for issued certificates, in days.
    pub validity_days: u32,
    /// Explicit signing algorithm; `None` derives one from the CSR key type.
    pub signing_algorithm: Option<SigningAlgorithm>,
    /// Name of the SKU policy to create/attach.
    pub policy_name: String,
    /// Region used to scope policy resource ARNs.
    pub region: String,
    /// Account used to scope policy resource ARNs.
    pub account_id: String,
    /// Which collaborator signs CSRs.
    pub issuer_backend: IssuerBackend,
    /// Resource paths the authorizer grants to verified devices.
    pub allowed_paths: Vec<String>,
    /// Retrieval poll bounds for the managed CA backend.
    pub poll: PollPolicy,
}

impl ProvisioningConfig {
    /// Minimal configuration; everything else takes defaults.
    pub fn new(
        policy_name: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            authority_ref: String::new(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            signing_algorithm: None,
            policy_name: policy_name.into(),
            region: region.into(),
            account_id: account_id.into(),
            issuer_backend: IssuerBackend::ManagedCa,
            allowed_paths: crate::authorizer::DEFAULT_ALLOWED_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_authority_ref(mut self, authority_ref: impl Into<String>) -> Self {
        self.authority_ref = authority_ref.into();
        self
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn with_signing_algorithm(mut self, algorithm: SigningAlgorithm) -> Self {
        self.signing_algorithm = Some(algorithm);
        self
    }

    pub fn with_issuer_backend(mut self, backend: IssuerBackend) -> Self {
        self.issuer_backend = backend;
        self
    }

    pub fn with_allowed_paths(mut self, paths: Vec<String>) -> Self {
        self.allowed_paths = paths;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Load configuration from `CERTBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, CbError> {
        let policy_name = require_env(ENV_POLICY_NAME)?;
        let region = require_env(ENV_REGION)?;
        let account_id = require_env(ENV_ACCOUNT_ID)?;

        let mut config = Self::new(policy_name, region, account_id);

        if let Ok(value) = env::var(ENV_ISSUER_BACKEND) {
            config.issuer_backend = IssuerBackend::parse(&value)?;
        }

        match env::var(ENV_CA_ARN) {
            Ok(value) => config.authority_ref = value,
            Err(_) if config.issuer_backend == IssuerBackend::ManagedCa => {
                return Err(CbError::ConfigError(format!(
                    "{} is required for the managed CA backend",
                    ENV_CA_ARN
                )));
            }
            Err(_) => {}
        }

        if let Ok(value) = env::var(ENV_VALIDITY_DAYS) {
            config.validity_days = value.parse().map_err(|_| {
                CbError::ConfigError(format!("{} is not a number: [{}]", ENV_VALIDITY_DAYS, value))
            })?;
        }

        if let Ok(value) = env::var(ENV_SIGNING_ALGORITHM) {
            config.signing_algorithm = Some(SigningAlgorithm::parse(&value)?);
        }

        config.allowed_paths = allowed_paths_from_env();

        Ok(config)
    }
}

/// Authorizer grant paths from the environment, or the defaults.
///
/// Usable on its own because the authorization entry point does not need
/// the rest of the provisioning configuration.
pub fn allowed_paths_from_env() -> Vec<String> {
    match env::var(ENV_ALLOWED_PATHS) {
        Ok(value) => value
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Err(_) => crate::authorizer::DEFAULT_ALLOWED_PATHS
            .iter()
            .map(|p| p.to_string())
            .collect(),
    }
}

fn require_env(name: &str) -> Result<String, CbError> {
    env::var(name).map_err(|_| CbError::ConfigError(format!("{} is not set", name)))
}
