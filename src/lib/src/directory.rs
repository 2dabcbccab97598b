//! Registered-key directory and identity verification.
//!
//! During pre-registration (outside this system) every device's public key
//! is written to a key-value directory under its device identity. The
//! identity verifier compares the key embedded in an incoming CSR against
//! that record. Records store the key as a base64-wrapped PEM blob so the
//! directory only ever carries printable text; both sides of the comparison
//! are therefore canonicalized (decoded down to the SubjectPublicKeyInfo
//! DER and re-encoded to one PEM form) before the byte comparison, so that
//! line-wrapping or header variance between encoders can never flip the
//! decision.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::csr::DecodedCsr;
use crate::device::DeviceIdentity;
use crate::error::CbError;

/// A public key record from the directory, exactly as stored.
#[derive(Debug, Clone)]
pub struct RegisteredPublicKey {
    /// Device identity the key was registered under.
    pub device_id: String,
    /// Base64-encoded PEM public key.
    pub pubkey_b64: String,
}

/// Read-only key-value directory of pre-registered device public keys.
pub trait KeyDirectory {
    /// Look up the registered public key for a device identity.
    ///
    /// `Ok(None)` means the identity has no record; callers decide whether
    /// that is a deny or an error.
    fn lookup(&self, identity: &DeviceIdentity) -> Result<Option<RegisteredPublicKey>, CbError>;
}

/// Re-encode a SubjectPublicKeyInfo DER blob as canonical PEM.
pub fn canonical_public_key_pem(der: &[u8]) -> String {
    let block = pem::Pem::new("PUBLIC KEY", der.to_vec());
    pem::encode(&block)
}

/// Compares CSR-embedded public keys against directory records.
pub struct IdentityVerifier<'a> {
    directory: &'a dyn KeyDirectory,
}

impl<'a> IdentityVerifier<'a> {
    pub fn new(directory: &'a dyn KeyDirectory) -> Self {
        Self { directory }
    }

    /// Verify that the CSR's embedded public key matches the registered one.
    ///
    /// Returns `Ok(())` on a byte-exact match of the canonicalized keys.
    /// A missing record is `UnknownDevice`; a mismatch or an undecodable
    /// stored record is `AuthorizationDenied`. Every error return is a deny
    /// from the front door's point of view.
    pub fn verify(&self, csr: &DecodedCsr) -> Result<(), CbError> {
        let identity = csr.identity();

        let record = self
            .directory
            .lookup(identity)?
            .ok_or_else(|| CbError::UnknownDevice(identity.to_string()))?;

        let stored_der = decode_stored_key(&record)?;

        let stored_pem = canonical_public_key_pem(&stored_der);
        let request_pem = canonical_public_key_pem(csr.public_key_der());

        if stored_pem != request_pem {
            log::info!("public key mismatch for device [{}]", identity);
            return Err(CbError::AuthorizationDenied(format!(
                "public key mismatch for device [{}]",
                identity
            )));
        }

        log::debug!("public key verified for device [{}]", identity);
        Ok(())
    }
}

/// Decode a stored record down to validated SubjectPublicKeyInfo DER.
fn decode_stored_key(record: &RegisteredPublicKey) -> Result<Vec<u8>, CbError> {
    let pem_bytes = BASE64.decode(record.pubkey_b64.trim().as_bytes()).map_err(|e| {
        CbError::AuthorizationDenied(format!(
            "stored key for [{}] is not valid base64: {}",
            record.device_id, e
        ))
    })?;

    let block = pem::parse(&pem_bytes).map_err(|e| {
        CbError::AuthorizationDenied(format!(
            "stored key for [{}] is not valid PEM: {}",
            record.device_id, e
        ))
    })?;

    // Reject records that do not hold a well-formed SubjectPublicKeyInfo.
    spki::SubjectPublicKeyInfoRef::try_from(block.contents()).map_err(|e| {
        CbError::AuthorizationDenied(format!(
            "stored key for [{}] is not a valid public key: {}",
            record.device_id, e
        ))
    })?;

    Ok(block.contents().to_vec())
}

/// HTTP key directory client.
///
/// Wire contract: `GET {base}/devices/{identity}` returns 200 with
/// `{"deviceId": ..., "pubkey": <base64 PEM>}`, or 404 when the identity
/// was never pre-registered.
pub struct HttpKeyDirectory {
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Debug, serde::Deserialize)]
struct DirectoryRecord {
    #[serde(rename = "deviceId")]
    device_id: String,
    pubkey: String,
}

impl HttpKeyDirectory {
    /// Create a client for a directory service at `base_url` (no trailing
    /// slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        // Return responses for all status codes so error bodies stay readable.
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            base_url: base_url.into(),
            agent,
        }
    }
}

impl KeyDirectory for HttpKeyDirectory {
    fn lookup(&self, identity: &DeviceIdentity) -> Result<Option<RegisteredPublicKey>, CbError> {
        let url = format!("{}/devices/{}", self.base_url, identity);

        let response = self.agent.get(&url).call().map_err(|e| {
            CbError::AuthorizationDenied(format!("directory lookup failed: {}", e))
        })?;

        let status = response.status();
        if status == 404 {
            return Ok(None);
        }

        let body = response.into_body().read_to_string().map_err(|e| {
            CbError::AuthorizationDenied(format!("failed to read directory response: {}", e))
        })?;

        if status != 200 {
            return Err(CbError::AuthorizationDenied(format!(
                "directory returned status {}: {}",
                status, body
            )));
        }

        let record: DirectoryRecord = serde_json::from_str(&body).map_err(|e| {
            CbError::AuthorizationDenied(format!("failed to parse directory response: {}", e))
        })?;

        Ok(Some(RegisteredPublicKey {
            device_id: record.device_id,
            pubkey_b64: record.pubkey,
        }))
    }
}
