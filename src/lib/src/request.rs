//! Front-door request envelope.
//!
//! Both entry points receive the same envelope shape from the HTTPS front
//! door: a header map carrying the transport-encoded CSR, plus (for the
//! authorizer) the method ARN under evaluation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An inbound request as delivered by the front door.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(rename = "methodArn", default, skip_serializing_if = "Option::is_none")]
    pub method_arn: Option<String>,
}

impl RequestEnvelope {
    /// Header field holding the base64-encoded PEM CSR.
    pub const CSR_HEADER: &'static str = "device-csr";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_method_arn(mut self, arn: impl Into<String>) -> Self {
        self.method_arn = Some(arn.into());
        self
    }

    /// Case-insensitive header lookup; gateways disagree on header casing.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str).or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    /// The transport-encoded CSR, if present.
    pub fn csr(&self) -> Option<&str> {
        self.header(Self::CSR_HEADER)
    }

    /// The method ARN, if present.
    pub fn method_arn(&self) -> Option<&str> {
        self.method_arn.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_header_lookup() {
        let envelope = RequestEnvelope::new().with_header("device-csr", "Zm9v");
        assert_eq!(envelope.csr(), Some("Zm9v"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let envelope = RequestEnvelope::new().with_header("Device-CSR", "Zm9v");
        assert_eq!(envelope.csr(), Some("Zm9v"));
    }

    #[test]
    fn test_missing_header() {
        let envelope = RequestEnvelope::new();
        assert!(envelope.csr().is_none());
        assert!(envelope.method_arn().is_none());
    }

    #[test]
    fn test_envelope_deserialization() {
        let json = r#"{
            "headers": {"device-csr": "Zm9v"},
            "methodArn": "arn:aws:execute-api:us-east-1:1:api/prod/POST/new"
        }"#;

        let envelope: RequestEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.csr(), Some("Zm9v"));
        assert!(envelope.method_arn().unwrap().starts_with("arn:"));
    }
}
