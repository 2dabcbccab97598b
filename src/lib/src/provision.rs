//! Provisioning orchestration.
//!
//! Sequences the full issuance workflow for one CSR:
//!
//! ```text
//! Decoded → Issued → Registered → ThingBound → PolicyBound → Complete
//! ```
//!
//! Transitions are strictly forward; no stage runs before its predecessor
//! succeeds, and the first hard failure halts the workflow with the stage
//! and cause. Completed side effects are never rolled back: a certificate
//! issued and registered before a later stage fails stays issued and
//! registered server-side, but is never returned to the caller.

use serde::Serialize;

use crate::ca::{CaClient, CertificateAuthority, SigningAlgorithm};
use crate::config::{IssuerBackend, ProvisioningConfig};
use crate::csr::DecodedCsr;
use crate::error::CbError;
use crate::policy::PolicyBinder;
use crate::registry::DeviceRegistry;
use crate::request::RequestEnvelope;
use crate::thing::ThingResolver;

/// The workflow stage a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStage {
    Decode,
    Issue,
    Register,
    AttachThing,
    BindPolicy,
}

impl ProvisioningStage {
    /// Map an error back to the stage that produces it.
    pub fn of(error: &CbError) -> Option<Self> {
        match error {
            CbError::MalformedRequest(_) => Some(ProvisioningStage::Decode),
            CbError::IssuanceFailed(_) | CbError::IssuanceTimeout { .. } => {
                Some(ProvisioningStage::Issue)
            }
            CbError::RegistrationFailed(_) => Some(ProvisioningStage::Register),
            CbError::ThingResolutionFailed(_) => Some(ProvisioningStage::AttachThing),
            CbError::PolicyBindFailed(_) => Some(ProvisioningStage::BindPolicy),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProvisioningStage::Decode => "decode",
            ProvisioningStage::Issue => "issue",
            ProvisioningStage::Register => "register",
            ProvisioningStage::AttachThing => "attach-thing",
            ProvisioningStage::BindPolicy => "bind-policy",
        };
        write!(f, "{}", name)
    }
}

/// Result of a completed provisioning workflow.
#[derive(Debug, Clone)]
pub struct ProvisionedDevice {
    /// The issued certificate, PEM-encoded.
    pub certificate_pem: String,
    /// Connection endpoint, when the registry exposes one.
    pub endpoint: Option<String>,
}

/// Wire response returned to the front door on success.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionResponse {
    pub certificate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl From<ProvisionedDevice> for ProvisionResponse {
    fn from(device: ProvisionedDevice) -> Self {
        Self {
            certificate: device.certificate_pem,
            endpoint: device.endpoint,
        }
    }
}

/// Drives the provisioning workflow against the configured collaborators.
///
/// Holds no per-request state; one instance serves any number of
/// independent requests.
pub struct Provisioner<'a> {
    config: ProvisioningConfig,
    authority: &'a dyn CertificateAuthority,
    registry: &'a dyn DeviceRegistry,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        config: ProvisioningConfig,
        authority: &'a dyn CertificateAuthority,
        registry: &'a dyn DeviceRegistry,
    ) -> Self {
        Self {
            config,
            authority,
            registry,
        }
    }

    /// Provision a device from a front-door request envelope.
    pub fn provision(&self, envelope: &RequestEnvelope) -> Result<ProvisionedDevice, CbError> {
        self.run(envelope).map_err(|e| {
            match ProvisioningStage::of(&e) {
                Some(stage) => log::error!("provisioning failed at stage [{}]: {}", stage, e),
                None => log::error!("provisioning failed: {}", e),
            }
            e
        })
    }

    /// Provision a device and format the front-door response.
    pub fn handle(&self, envelope: &RequestEnvelope) -> Result<ProvisionResponse, CbError> {
        self.provision(envelope).map(ProvisionResponse::from)
    }

    fn run(&self, envelope: &RequestEnvelope) -> Result<ProvisionedDevice, CbError> {
        let encoded = envelope.csr().ok_or_else(|| {
            CbError::MalformedRequest(format!("missing {} header", RequestEnvelope::CSR_HEADER))
        })?;
        let csr = DecodedCsr::from_transport(encoded)?;
        log::info!("provisioning request decoded for device [{}]", csr.identity());

        let (registration, certificate_pem) = match self.config.issuer_backend {
            IssuerBackend::ManagedCa => {
                let algorithm = self
                    .config
                    .signing_algorithm
                    .unwrap_or_else(|| SigningAlgorithm::for_key(csr.key_algorithm()));

                let issued = CaClient::new(self.authority)
                    .with_poll_policy(self.config.poll.clone())
                    .issue(
                        &csr,
                        &self.config.authority_ref,
                        self.config.validity_days,
                        algorithm,
                    )?;

                let registration = self
                    .registry
                    .register_certificate(&issued.certificate_pem)
                    .map_err(|e| CbError::RegistrationFailed(e.to_string()))?;

                (registration, issued.certificate_pem)
            }
            IssuerBackend::Registry => {
                // The registry signs and activates in one call; the
                // Registered state is reached directly.
                let (registration, certificate_pem) = self
                    .registry
                    .create_certificate_from_csr(csr.pem())
                    .map_err(|e| CbError::IssuanceFailed(e.to_string()))?;

                (registration, certificate_pem)
            }
        };
        log::info!(
            "certificate registered for device [{}]: {}",
            csr.identity(),
            registration.reference
        );

        ThingResolver::new(self.registry).attach(csr.identity(), &registration.reference)?;

        PolicyBinder::new(
            self.registry,
            &self.config.policy_name,
            &self.config.region,
            &self.config.account_id,
        )
        .bind(&registration.reference)?;

        // The endpoint is advisory; its absence does not fail an otherwise
        // complete provisioning.
        let endpoint = match self.registry.describe_endpoint() {
            Ok(address) => Some(address),
            Err(e) => {
                log::warn!("endpoint discovery failed, omitting from response: {}", e);
                None
            }
        };

        log::info!("provisioning complete for device [{}]", csr.identity());
        Ok(ProvisionedDevice {
            certificate_pem,
            endpoint,
        })
    }
}
