use std::time::Duration;

/// The certbridge error type.
#[derive(Debug, thiserror::Error)]
pub enum CbError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Unknown device: no registered public key for [{0}]")]
    UnknownDevice(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Certificate issuance failed: {0}")]
    IssuanceFailed(String),

    #[error("Certificate issuance timed out after {attempts} attempts ({waited:?})")]
    IssuanceTimeout { attempts: u32, waited: Duration },

    #[error("Certificate registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Thing resolution failed: {0}")]
    ThingResolutionFailed(String),

    #[error("Policy binding failed: {0}")]
    PolicyBindFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error")]
    IOError(#[from] std::io::Error),
}
