//! Request authorization for the provisioning API.
//!
//! The front door calls this entry point with the device's CSR and the
//! method ARN of the API method being invoked. A device is authorized when
//! the CSR's embedded public key matches its pre-registered key; the result
//! is a gateway policy document granting invocation of the provisioning
//! methods only, scoped to the exact API deployment named by the method ARN
//! so the grant cannot be replayed elsewhere.
//!
//! Builder state is constructed fresh for every request. Nothing in this
//! module is shared across invocations.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::csr::DecodedCsr;
use crate::directory::{IdentityVerifier, KeyDirectory};
use crate::error::CbError;
use crate::request::RequestEnvelope;

/// Policy language version expected by the gateway.
const POLICY_VERSION: &str = "2012-10-17";

/// Resource paths a verified device may invoke.
pub const DEFAULT_ALLOWED_PATHS: [&str; 2] = ["/new", "/proto"];

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[/.a-zA-Z0-9\-*]+$").expect("valid path pattern"))
}

/// HTTP methods recognized in gateway resource ARNs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Patch,
    Head,
    Delete,
    Options,
    All,
}

impl HttpVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVerb::Get => "GET",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Patch => "PATCH",
            HttpVerb::Head => "HEAD",
            HttpVerb::Delete => "DELETE",
            HttpVerb::Options => "OPTIONS",
            HttpVerb::All => "*",
        }
    }
}

/// A parsed gateway method ARN.
///
/// Shape: `arn:<partition>:execute-api:<region>:<account>:<apiId>/<stage>/<verb>/<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodArn {
    pub partition: String,
    pub region: String,
    pub account_id: String,
    pub api_id: String,
    pub stage: String,
    pub verb: String,
    pub resource: String,
}

impl MethodArn {
    pub fn parse(arn: &str) -> Result<Self, CbError> {
        let parts: Vec<&str> = arn.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" || parts[2] != "execute-api" {
            return Err(CbError::MalformedRequest(format!(
                "not an execute-api method ARN: [{}]",
                arn
            )));
        }

        let gateway: Vec<&str> = parts[5].splitn(4, '/').collect();
        if gateway.len() < 3 || gateway[0].is_empty() {
            return Err(CbError::MalformedRequest(format!(
                "method ARN is missing api-id/stage/verb: [{}]",
                arn
            )));
        }

        Ok(Self {
            partition: parts[1].to_string(),
            region: parts[3].to_string(),
            account_id: parts[4].to_string(),
            api_id: gateway[0].to_string(),
            stage: gateway[1].to_string(),
            verb: gateway[2].to_string(),
            resource: gateway.get(3).copied().unwrap_or("").to_string(),
        })
    }
}

/// Authorizer output consumed by the front door.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizerResponse {
    #[serde(rename = "principalId")]
    pub principal_id: String,
    #[serde(rename = "policyDocument")]
    pub policy_document: PolicyDocument,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: &'static str,
    #[serde(rename = "Statement")]
    pub statement: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyStatement {
    #[serde(rename = "Action")]
    pub action: &'static str,
    #[serde(rename = "Effect")]
    pub effect: &'static str,
    #[serde(rename = "Resource")]
    pub resource: Vec<String>,
}

/// Gateway policy builder, freshly constructed per request.
///
/// Collects allowed and denied methods scoped to one API deployment and
/// emits the policy document on `build`.
pub struct AuthPolicyBuilder {
    principal_id: String,
    partition: String,
    region: String,
    account_id: String,
    api_id: String,
    stage: String,
    allow: Vec<String>,
    deny: Vec<String>,
}

impl AuthPolicyBuilder {
    /// Scope a new builder to the deployment identified by a method ARN.
    pub fn new(principal_id: impl Into<String>, scope: &MethodArn) -> Self {
        Self {
            principal_id: principal_id.into(),
            partition: scope.partition.clone(),
            region: scope.region.clone(),
            account_id: scope.account_id.clone(),
            api_id: scope.api_id.clone(),
            stage: scope.stage.clone(),
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }

    /// Permit one method (verb + resource path).
    pub fn allow_method(&mut self, verb: HttpVerb, path: &str) -> Result<(), CbError> {
        let arn = self.method_resource_arn(verb, path)?;
        self.allow.push(arn);
        Ok(())
    }

    /// Deny one method (verb + resource path).
    pub fn deny_method(&mut self, verb: HttpVerb, path: &str) -> Result<(), CbError> {
        let arn = self.method_resource_arn(verb, path)?;
        self.deny.push(arn);
        Ok(())
    }

    fn method_resource_arn(&self, verb: HttpVerb, path: &str) -> Result<String, CbError> {
        if !path_pattern().is_match(path) {
            return Err(CbError::MalformedRequest(format!(
                "invalid resource path: [{}]",
                path
            )));
        }

        let path = path.strip_prefix('/').unwrap_or(path);

        Ok(format!(
            "arn:{}:execute-api:{}:{}:{}/{}/{}/{}",
            self.partition,
            self.region,
            self.account_id,
            self.api_id,
            self.stage,
            verb.as_str(),
            path
        ))
    }

    /// Emit the policy document.
    ///
    /// A builder with neither allowed nor denied methods is a programming
    /// error and is rejected rather than emitting an empty (implicit-deny)
    /// document the gateway would misread.
    pub fn build(self) -> Result<AuthorizerResponse, CbError> {
        if self.allow.is_empty() && self.deny.is_empty() {
            return Err(CbError::AuthorizationDenied(
                "no statements defined for the policy".to_string(),
            ));
        }

        let mut statement = Vec::new();
        if !self.allow.is_empty() {
            statement.push(PolicyStatement {
                action: "execute-api:Invoke",
                effect: "Allow",
                resource: self.allow,
            });
        }
        if !self.deny.is_empty() {
            statement.push(PolicyStatement {
                action: "execute-api:Invoke",
                effect: "Deny",
                resource: self.deny,
            });
        }

        Ok(AuthorizerResponse {
            principal_id: self.principal_id,
            policy_document: PolicyDocument {
                version: POLICY_VERSION,
                statement,
            },
        })
    }
}

/// Authorization entry point.
///
/// Decodes the CSR from the envelope, verifies the bound identity against
/// the directory, and on success grants POST on each of `allowed_paths`
/// scoped to the deployment in the envelope's method ARN. Every failure is
/// an error return; the front door maps any error to an unambiguous deny,
/// never a success-with-error body.
pub fn authorize(
    directory: &dyn KeyDirectory,
    envelope: &RequestEnvelope,
    allowed_paths: &[String],
) -> Result<AuthorizerResponse, CbError> {
    let encoded = envelope.csr().ok_or_else(|| {
        CbError::MalformedRequest(format!("missing {} header", RequestEnvelope::CSR_HEADER))
    })?;
    let csr = DecodedCsr::from_transport(encoded)?;

    IdentityVerifier::new(directory).verify(&csr)?;

    let method_arn = envelope
        .method_arn()
        .ok_or_else(|| CbError::MalformedRequest("missing method ARN".to_string()))?;
    let scope = MethodArn::parse(method_arn)?;

    log::info!(
        "device [{}] authorized for api [{}] stage [{}]",
        csr.identity(),
        scope.api_id,
        scope.stage
    );

    let mut builder = AuthPolicyBuilder::new(csr.identity().as_str(), &scope);
    for path in allowed_paths {
        builder.allow_method(HttpVerb::Post, path)?;
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str = "arn:aws:execute-api:us-east-1:123456789012:abcdef1234/prod/POST/new";

    #[test]
    fn test_method_arn_parse() {
        let arn = MethodArn::parse(ARN).unwrap();
        assert_eq!(arn.partition, "aws");
        assert_eq!(arn.region, "us-east-1");
        assert_eq!(arn.account_id, "123456789012");
        assert_eq!(arn.api_id, "abcdef1234");
        assert_eq!(arn.stage, "prod");
        assert_eq!(arn.verb, "POST");
        assert_eq!(arn.resource, "new");
    }

    #[test]
    fn test_method_arn_rejects_garbage() {
        assert!(MethodArn::parse("not an arn").is_err());
        assert!(MethodArn::parse("arn:aws:iot:us-east-1:1:thing/t").is_err());
        assert!(MethodArn::parse("arn:aws:execute-api:us-east-1:1:api-only").is_err());
    }

    #[test]
    fn test_builder_scopes_resources_to_deployment() {
        let scope = MethodArn::parse(ARN).unwrap();
        let mut builder = AuthPolicyBuilder::new("dev-001", &scope);
        builder.allow_method(HttpVerb::Post, "/new").unwrap();
        builder.allow_method(HttpVerb::Post, "/proto").unwrap();
        let response = builder.build().unwrap();

        assert_eq!(response.principal_id, "dev-001");
        assert_eq!(response.policy_document.version, "2012-10-17");
        assert_eq!(response.policy_document.statement.len(), 1);

        let statement = &response.policy_document.statement[0];
        assert_eq!(statement.effect, "Allow");
        assert_eq!(
            statement.resource,
            vec![
                "arn:aws:execute-api:us-east-1:123456789012:abcdef1234/prod/POST/new",
                "arn:aws:execute-api:us-east-1:123456789012:abcdef1234/prod/POST/proto",
            ]
        );
    }

    #[test]
    fn test_builder_state_is_per_request() {
        let scope = MethodArn::parse(ARN).unwrap();

        let mut first = AuthPolicyBuilder::new("dev-001", &scope);
        first.allow_method(HttpVerb::Post, "/new").unwrap();
        let first = first.build().unwrap();

        // A second builder starts empty; nothing leaks from the first.
        let mut second = AuthPolicyBuilder::new("dev-002", &scope);
        second.allow_method(HttpVerb::Post, "/proto").unwrap();
        let second = second.build().unwrap();

        assert_eq!(first.policy_document.statement[0].resource.len(), 1);
        assert_eq!(second.policy_document.statement[0].resource.len(), 1);
        assert_ne!(
            first.policy_document.statement[0].resource,
            second.policy_document.statement[0].resource
        );
    }

    #[test]
    fn test_invalid_path_rejected() {
        let scope = MethodArn::parse(ARN).unwrap();
        let mut builder = AuthPolicyBuilder::new("dev-001", &scope);
        let result = builder.allow_method(HttpVerb::Post, "/new?query=1");
        assert!(matches!(result, Err(CbError::MalformedRequest(_))));
    }

    #[test]
    fn test_empty_builder_rejected() {
        let scope = MethodArn::parse(ARN).unwrap();
        let builder = AuthPolicyBuilder::new("dev-001", &scope);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_deny_statement_emitted_separately() {
        let scope = MethodArn::parse(ARN).unwrap();
        let mut builder = AuthPolicyBuilder::new("dev-001", &scope);
        builder.allow_method(HttpVerb::Post, "/new").unwrap();
        builder.deny_method(HttpVerb::All, "*").unwrap();
        let response = builder.build().unwrap();

        assert_eq!(response.policy_document.statement.len(), 2);
        assert_eq!(response.policy_document.statement[1].effect, "Deny");
        assert!(response.policy_document.statement[1].resource[0].ends_with("/*/*"));
    }

    #[test]
    fn test_response_serialization_shape() {
        let scope = MethodArn::parse(ARN).unwrap();
        let mut builder = AuthPolicyBuilder::new("dev-001", &scope);
        builder.allow_method(HttpVerb::Post, "/new").unwrap();
        let response = builder.build().unwrap();

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["principalId"], "dev-001");
        assert_eq!(json["policyDocument"]["Version"], "2012-10-17");
        assert_eq!(
            json["policyDocument"]["Statement"][0]["Action"],
            "execute-api:Invoke"
        );
    }
}
