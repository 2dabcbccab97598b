//! Device registry client.
//!
//! The registry is the device-management backend: it holds imported
//! certificates, logical device records ("things"), named authorization
//! policies, and the fleet's connection endpoint. This module defines the
//! seam (`DeviceRegistry`) the provisioning workflow drives, plus an HTTP
//! implementation.
//!
//! Registry errors are typed so callers can tell "absent, go create it"
//! apart from "the backend is broken", since the two require opposite
//! handling.

use serde::{Deserialize, Serialize};

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The named record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Creation raced with another writer; the record already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Anything else the backend reports.
    #[error("registry backend error: {0}")]
    Backend(String),
}

/// Registry-assigned reference to an imported certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRef(pub String);

impl std::fmt::Display for CertificateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An imported certificate and its activation status.
#[derive(Debug, Clone)]
pub struct CertificateRegistration {
    pub reference: CertificateRef,
    pub active: bool,
}

/// A logical device record.
#[derive(Debug, Clone)]
pub struct ThingRecord {
    pub name: String,
    pub reference: String,
}

/// A named authorization policy.
#[derive(Debug, Clone)]
pub struct PolicyRecord {
    pub name: String,
    pub document: String,
}

/// The device-management backend seam.
pub trait DeviceRegistry {
    /// Import a CA-signed certificate, active immediately.
    ///
    /// Content-level deduplication of repeated imports is the backend's
    /// concern, not the caller's.
    fn register_certificate(&self, certificate_pem: &str)
        -> Result<CertificateRegistration, RegistryError>;

    /// Have the registry itself sign a CSR and activate the result.
    ///
    /// Returns the registration together with the signed certificate PEM.
    /// Used by deployments without a managed CA; the separate registration
    /// step is inherently satisfied.
    fn create_certificate_from_csr(
        &self,
        csr_pem: &str,
    ) -> Result<(CertificateRegistration, String), RegistryError>;

    /// Look up a thing by name. `Ok(None)` when it does not exist.
    fn describe_thing(&self, name: &str) -> Result<Option<ThingRecord>, RegistryError>;

    /// Create a thing. `AlreadyExists` when a concurrent creation won.
    fn create_thing(&self, name: &str) -> Result<ThingRecord, RegistryError>;

    /// Bind a certificate principal to a thing. Additive and idempotent on
    /// the backend side.
    fn attach_thing_principal(
        &self,
        thing: &str,
        principal: &CertificateRef,
    ) -> Result<(), RegistryError>;

    /// Look up a policy by name. `Ok(None)` when it does not exist.
    fn get_policy(&self, name: &str) -> Result<Option<PolicyRecord>, RegistryError>;

    /// Create a policy. `AlreadyExists` when a concurrent creation won.
    fn create_policy(&self, name: &str, document: &str) -> Result<(), RegistryError>;

    /// Attach a policy to a certificate principal. Idempotent on the
    /// backend side.
    fn attach_policy(&self, name: &str, target: &CertificateRef) -> Result<(), RegistryError>;

    /// The address devices connect to once provisioned.
    fn describe_endpoint(&self) -> Result<String, RegistryError>;
}

/// HTTP device registry client.
///
/// Wire contract (all bodies JSON):
/// - `POST {base}/certificates/register` `{certificatePem, setAsActive}` → `{certificateArn, status}`
/// - `POST {base}/certificates/from-csr` `{certificateSigningRequest, setAsActive}` → `{certificateArn, certificatePem}`
/// - `GET  {base}/things/{name}` → `{thingName, thingArn}` or 404
/// - `POST {base}/things` `{thingName}` → `{thingName, thingArn}`, 409 when it exists
/// - `PUT  {base}/things/{name}/principals` `{principal}`
/// - `GET  {base}/policies/{name}` → `{policyName, policyDocument}` or 404
/// - `POST {base}/policies` `{policyName, policyDocument}`, 409 when it exists
/// - `PUT  {base}/policies/{name}/targets` `{target}`
/// - `GET  {base}/endpoint` → `{endpointAddress}`
pub struct HttpDeviceRegistry {
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct RegisterCertificateBody<'a> {
    #[serde(rename = "certificatePem")]
    certificate_pem: &'a str,
    #[serde(rename = "setAsActive")]
    set_as_active: bool,
}

#[derive(Debug, Deserialize)]
struct RegisterCertificateResponse {
    #[serde(rename = "certificateArn")]
    certificate_arn: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct CertificateFromCsrBody<'a> {
    #[serde(rename = "certificateSigningRequest")]
    certificate_signing_request: &'a str,
    #[serde(rename = "setAsActive")]
    set_as_active: bool,
}

#[derive(Debug, Deserialize)]
struct CertificateFromCsrResponse {
    #[serde(rename = "certificateArn")]
    certificate_arn: String,
    #[serde(rename = "certificatePem")]
    certificate_pem: String,
}

#[derive(Debug, Serialize)]
struct CreateThingBody<'a> {
    #[serde(rename = "thingName")]
    thing_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ThingResponse {
    #[serde(rename = "thingName")]
    thing_name: String,
    #[serde(rename = "thingArn")]
    thing_arn: String,
}

#[derive(Debug, Serialize)]
struct AttachPrincipalBody<'a> {
    principal: &'a str,
}

#[derive(Debug, Deserialize)]
struct PolicyResponse {
    #[serde(rename = "policyName")]
    policy_name: String,
    #[serde(rename = "policyDocument")]
    policy_document: String,
}

#[derive(Debug, Serialize)]
struct CreatePolicyBody<'a> {
    #[serde(rename = "policyName")]
    policy_name: &'a str,
    #[serde(rename = "policyDocument")]
    policy_document: &'a str,
}

#[derive(Debug, Serialize)]
struct AttachPolicyBody<'a> {
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct EndpointResponse {
    #[serde(rename = "endpointAddress")]
    endpoint_address: String,
}

impl HttpDeviceRegistry {
    /// Create a client for a registry service at `base_url` (no trailing
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

    fn get(&self, path: &str) -> Result<(u16, String), RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| RegistryError::Backend(format!("GET {} failed: {}", path, e)))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| RegistryError::Backend(format!("failed to read response: {}", e)))?;

        Ok((status, body))
    }

    fn send_json<B: Serialize>(
        &self,
        method: &str,
        path: &str,
        body: &B,
    ) -> Result<(u16, String), RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        let json = serde_json::to_string(body)
            .map_err(|e| RegistryError::Backend(format!("failed to serialize request: {}", e)))?;

        let request = match method {
            "PUT" => self.agent.put(&url),
            _ => self.agent.post(&url),
        };

        let response = request
            .header("Content-Type", "application/json")
            .send(json.as_bytes())
            .map_err(|e| RegistryError::Backend(format!("{} {} failed: {}", method, path, e)))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| RegistryError::Backend(format!("failed to read response: {}", e)))?;

        Ok((status, body))
    }

    fn expect_success(status: u16, body: &str, context: &str) -> Result<(), RegistryError> {
        match status {
            200 | 201 | 204 => Ok(()),
            409 => Err(RegistryError::AlreadyExists(context.to_string())),
            404 => Err(RegistryError::NotFound(context.to_string())),
            _ => Err(RegistryError::Backend(format!(
                "{}: status {}: {}",
                context, status, body
            ))),
        }
    }
}

impl DeviceRegistry for HttpDeviceRegistry {
    fn register_certificate(
        &self,
        certificate_pem: &str,
    ) -> Result<CertificateRegistration, RegistryError> {
        let body = RegisterCertificateBody {
            certificate_pem,
            set_as_active: true,
        };
        let (status, response) = self.send_json("POST", "/certificates/register", &body)?;
        Self::expect_success(status, &response, "registering certificate")?;

        let parsed: RegisterCertificateResponse = serde_json::from_str(&response)
            .map_err(|e| RegistryError::Backend(format!("failed to parse response: {}", e)))?;

        Ok(CertificateRegistration {
            reference: CertificateRef(parsed.certificate_arn),
            active: parsed.status.as_deref().map(|s| s == "ACTIVE").unwrap_or(true),
        })
    }

    fn create_certificate_from_csr(
        &self,
        csr_pem: &str,
    ) -> Result<(CertificateRegistration, String), RegistryError> {
        let body = CertificateFromCsrBody {
            certificate_signing_request: csr_pem,
            set_as_active: true,
        };
        let (status, response) = self.send_json("POST", "/certificates/from-csr", &body)?;
        Self::expect_success(status, &response, "creating certificate from CSR")?;

        let parsed: CertificateFromCsrResponse = serde_json::from_str(&response)
            .map_err(|e| RegistryError::Backend(format!("failed to parse response: {}", e)))?;

        Ok((
            CertificateRegistration {
                reference: CertificateRef(parsed.certificate_arn),
                active: true,
            },
            parsed.certificate_pem,
        ))
    }

    fn describe_thing(&self, name: &str) -> Result<Option<ThingRecord>, RegistryError> {
        let (status, body) = self.get(&format!("/things/{}", name))?;

        if status == 404 {
            return Ok(None);
        }
        if status != 200 {
            return Err(RegistryError::Backend(format!(
                "describing thing [{}]: status {}: {}",
                name, status, body
            )));
        }

        let parsed: ThingResponse = serde_json::from_str(&body)
            .map_err(|e| RegistryError::Backend(format!("failed to parse response: {}", e)))?;

        Ok(Some(ThingRecord {
            name: parsed.thing_name,
            reference: parsed.thing_arn,
        }))
    }

    fn create_thing(&self, name: &str) -> Result<ThingRecord, RegistryError> {
        let body = CreateThingBody { thing_name: name };
        let (status, response) = self.send_json("POST", "/things", &body)?;
        Self::expect_success(status, &response, &format!("creating thing [{}]", name))?;

        let parsed: ThingResponse = serde_json::from_str(&response)
            .map_err(|e| RegistryError::Backend(format!("failed to parse response: {}", e)))?;

        Ok(ThingRecord {
            name: parsed.thing_name,
            reference: parsed.thing_arn,
        })
    }

    fn attach_thing_principal(
        &self,
        thing: &str,
        principal: &CertificateRef,
    ) -> Result<(), RegistryError> {
        let body = AttachPrincipalBody {
            principal: &principal.0,
        };
        let (status, response) =
            self.send_json("PUT", &format!("/things/{}/principals", thing), &body)?;
        Self::expect_success(
            status,
            &response,
            &format!("attaching principal to [{}]", thing),
        )
    }

    fn get_policy(&self, name: &str) -> Result<Option<PolicyRecord>, RegistryError> {
        let (status, body) = self.get(&format!("/policies/{}", name))?;

        if status == 404 {
            return Ok(None);
        }
        if status != 200 {
            return Err(RegistryError::Backend(format!(
                "describing policy [{}]: status {}: {}",
                name, status, body
            )));
        }

        let parsed: PolicyResponse = serde_json::from_str(&body)
            .map_err(|e| RegistryError::Backend(format!("failed to parse response: {}", e)))?;

        Ok(Some(PolicyRecord {
            name: parsed.policy_name,
            document: parsed.policy_document,
        }))
    }

    fn create_policy(&self, name: &str, document: &str) -> Result<(), RegistryError> {
        let body = CreatePolicyBody {
            policy_name: name,
            policy_document: document,
        };
        let (status, response) = self.send_json("POST", "/policies", &body)?;
        Self::expect_success(status, &response, &format!("creating policy [{}]", name))
    }

    fn attach_policy(&self, name: &str, target: &CertificateRef) -> Result<(), RegistryError> {
        let body = AttachPolicyBody { target: &target.0 };
        let (status, response) =
            self.send_json("PUT", &format!("/policies/{}/targets", name), &body)?;
        Self::expect_success(
            status,
            &response,
            &format!("attaching policy [{}] to [{}]", name, target),
        )
    }

    fn describe_endpoint(&self) -> Result<String, RegistryError> {
        let (status, body) = self.get("/endpoint")?;

        if status != 200 {
            return Err(RegistryError::Backend(format!(
                "describing endpoint: status {}: {}",
                status, body
            )));
        }

        let parsed: EndpointResponse = serde_json::from_str(&body)
            .map_err(|e| RegistryError::Backend(format!("failed to parse response: {}", e)))?;

        Ok(parsed.endpoint_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        assert_eq!(
            RegistryError::NotFound("thing [dev-001]".to_string()).to_string(),
            "not found: thing [dev-001]"
        );
        assert_eq!(
            RegistryError::AlreadyExists("policy [widgiot]".to_string()).to_string(),
            "already exists: policy [widgiot]"
        );
    }

    #[test]
    fn test_expect_success_status_mapping() {
        assert!(HttpDeviceRegistry::expect_success(200, "", "op").is_ok());
        assert!(HttpDeviceRegistry::expect_success(201, "", "op").is_ok());
        assert!(HttpDeviceRegistry::expect_success(204, "", "op").is_ok());

        assert!(matches!(
            HttpDeviceRegistry::expect_success(409, "", "op"),
            Err(RegistryError::AlreadyExists(_))
        ));
        assert!(matches!(
            HttpDeviceRegistry::expect_success(404, "", "op"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            HttpDeviceRegistry::expect_success(500, "boom", "op"),
            Err(RegistryError::Backend(_))
        ));
    }

    #[test]
    fn test_register_body_serialization() {
        let body = RegisterCertificateBody {
            certificate_pem: "-----BEGIN CERTIFICATE-----",
            set_as_active: true,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("certificatePem"));
        assert!(json.contains("\"setAsActive\":true"));
    }

    #[test]
    fn test_thing_response_deserialization() {
        let json = r#"{"thingName": "dev-001", "thingArn": "arn:registry:thing/dev-001"}"#;
        let parsed: ThingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.thing_name, "dev-001");
        assert_eq!(parsed.thing_arn, "arn:registry:thing/dev-001");
    }

    #[test]
    fn test_from_csr_response_deserialization() {
        let json = r#"{
            "certificateArn": "arn:registry:cert/0001",
            "certificatePem": "-----BEGIN CERTIFICATE-----"
        }"#;
        let parsed: CertificateFromCsrResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.certificate_arn, "arn:registry:cert/0001");
        assert!(parsed.certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_endpoint_response_deserialization() {
        let json = r#"{"endpointAddress": "abc123-ats.iot.us-east-1.example.com"}"#;
        let parsed: EndpointResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.endpoint_address, "abc123-ats.iot.us-east-1.example.com");
    }
}
