//! Device identity handling.
//!
//! A device identity is the Subject Common Name carried by a CSR and is the
//! primary key for every directory and registry lookup. Identities are
//! validated against the backend's allowed-name charset before any external
//! call is made with them.

use std::fmt;

use crate::error::CbError;

/// Maximum accepted identity length, matching the registry's thing-name limit.
const MAX_IDENTITY_LEN: usize = 64;

/// Unique device identifier extracted from a CSR Subject CN.
///
/// Device IDs are typically serial numbers (e.g., "SN-2024-001234"), MAC
/// addresses, or custom factory formats (e.g., "line-3-device-42").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Validate and wrap a raw identity string.
    ///
    /// Accepts non-empty identities of at most 64 characters consisting of
    /// alphanumerics, dash, underscore, colon, and dot. Anything else is
    /// rejected as a malformed request since identities only ever originate
    /// from request data.
    pub fn new(id: impl Into<String>) -> Result<Self, CbError> {
        let id = id.into();

        if id.is_empty() {
            return Err(CbError::MalformedRequest(
                "device identity is empty".to_string(),
            ));
        }

        if id.len() > MAX_IDENTITY_LEN {
            return Err(CbError::MalformedRequest(format!(
                "device identity exceeds {} characters",
                MAX_IDENTITY_LEN
            )));
        }

        let is_safe = id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ':' || c == '.');

        if !is_safe {
            return Err(CbError::MalformedRequest(format!(
                "device identity [{}] contains characters outside the allowed charset",
                id
            )));
        }

        Ok(Self(id))
    }

    /// Get the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
