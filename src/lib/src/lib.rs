//! X.509 device identity issuance and provisioning.
//!
//! certbridge bridges a certificate signing request submitted over an HTTPS
//! front door to a managed certificate authority, then registers the
//! resulting device identity (certificate, thing record, and attached
//! authorization policy) with a device-management backend.
//!
//! Two entry points share one CSR-decoding capability:
//!
//! - [`authorizer::authorize`] checks the CSR's bound identity against the
//!   pre-registered public key directory and emits a gateway policy
//!   document scoped to the provisioning API only.
//! - [`provision::Provisioner`] drives the issuance workflow: submit the
//!   CSR to the CA, poll until signed, import into the registry, bind the
//!   device's thing record, attach the SKU policy.
//!
//! External collaborators (key directory, certificate authority, device
//! registry) sit behind traits with HTTP implementations; every workflow
//! component is testable against in-memory fakes.

#![forbid(unsafe_code)]

pub mod authorizer;
pub mod ca;
pub mod config;
pub mod csr;
pub mod device;
pub mod directory;
mod error;
pub mod policy;
pub mod provision;
pub mod registry;
pub mod request;
pub mod thing;

pub use error::CbError;

pub use authorizer::{authorize, AuthorizerResponse};
pub use ca::{CaClient, CertificateAuthority, HttpCaClient, PollPolicy, SigningAlgorithm};
pub use config::{IssuerBackend, ProvisioningConfig};
pub use csr::DecodedCsr;
pub use device::DeviceIdentity;
pub use directory::{HttpKeyDirectory, IdentityVerifier, KeyDirectory};
pub use provision::{ProvisionResponse, ProvisionedDevice, Provisioner, ProvisioningStage};
pub use registry::{DeviceRegistry, HttpDeviceRegistry};
pub use request::RequestEnvelope;

pub mod reexports {
    pub use {log, serde_json, thiserror};
}
