//! Policy binding.
//!
//! Each product SKU carries one named authorization policy in the registry.
//! The binder creates the policy from its template the first time any
//! device of that SKU is provisioned and attaches it to every certificate
//! provisioned since. Template parameters scope every resource ARN to the
//! owning account and region, and the statements reference the connecting
//! thing's own name, so a device can only ever connect, publish, and
//! subscribe as itself.

use serde_json::json;

use crate::error::CbError;
use crate::registry::{CertificateRef, DeviceRegistry, RegistryError};

/// Render the SKU policy document for an account and region.
pub fn render_policy_document(region: &str, account_id: &str) -> String {
    let document = json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["iot:Connect"],
                "Resource": [
                    format!("arn:aws:iot:{}:{}:client/${{iot:Connection.Thing.ThingName}}", region, account_id)
                ]
            },
            {
                "Effect": "Allow",
                "Action": ["iot:Publish", "iot:Receive"],
                "Resource": [
                    format!("arn:aws:iot:{}:{}:topic/devices/${{iot:Connection.Thing.ThingName}}/*", region, account_id)
                ]
            },
            {
                "Effect": "Allow",
                "Action": ["iot:Subscribe"],
                "Resource": [
                    format!("arn:aws:iot:{}:{}:topicfilter/devices/${{iot:Connection.Thing.ThingName}}/*", region, account_id)
                ]
            }
        ]
    });

    document.to_string()
}

/// Ensures the SKU policy exists and attaches it to certificates.
pub struct PolicyBinder<'a> {
    registry: &'a dyn DeviceRegistry,
    policy_name: &'a str,
    region: &'a str,
    account_id: &'a str,
}

impl<'a> PolicyBinder<'a> {
    pub fn new(
        registry: &'a dyn DeviceRegistry,
        policy_name: &'a str,
        region: &'a str,
        account_id: &'a str,
    ) -> Self {
        Self {
            registry,
            policy_name,
            region,
            account_id,
        }
    }

    /// Attach the (possibly just-created) SKU policy to `certificate`.
    ///
    /// Creation races with a concurrent first-provision are tolerated:
    /// `AlreadyExists` on create means another writer won and the policy is
    /// usable. Lookup backend failures and attach failures are hard
    /// (`PolicyBindFailed`).
    pub fn bind(&self, certificate: &CertificateRef) -> Result<(), CbError> {
        match self.registry.get_policy(self.policy_name) {
            Ok(Some(_)) => {
                log::debug!("policy [{}] exists, attaching", self.policy_name);
            }
            Ok(None) => {
                log::info!("policy [{}] does not exist, creating", self.policy_name);
                let document = render_policy_document(self.region, self.account_id);
                match self.registry.create_policy(self.policy_name, &document) {
                    Ok(()) => {}
                    Err(RegistryError::AlreadyExists(_)) => {
                        log::debug!(
                            "policy [{}] created concurrently, attaching",
                            self.policy_name
                        );
                    }
                    Err(e) => {
                        return Err(CbError::PolicyBindFailed(format!(
                            "creating [{}]: {}",
                            self.policy_name, e
                        )))
                    }
                }
            }
            Err(e) => {
                return Err(CbError::PolicyBindFailed(format!(
                    "looking up [{}]: {}",
                    self.policy_name, e
                )))
            }
        }

        self.registry
            .attach_policy(self.policy_name, certificate)
            .map_err(|e| {
                CbError::PolicyBindFailed(format!(
                    "attaching [{}] to [{}]: {}",
                    self.policy_name, certificate, e
                ))
            })?;

        log::info!(
            "policy [{}] attached to certificate [{}]",
            self.policy_name,
            certificate
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CertificateRegistration, PolicyRecord, ThingRecord};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegistry {
        policies: Mutex<HashMap<String, String>>,
        creates: Mutex<u32>,
        attachments: Mutex<Vec<(String, String)>>,
        fail_attach: bool,
        create_races: bool,
    }

    impl DeviceRegistry for FakeRegistry {
        fn register_certificate(
            &self,
            _certificate_pem: &str,
        ) -> Result<CertificateRegistration, RegistryError> {
            unimplemented!("not exercised here")
        }

        fn create_certificate_from_csr(
            &self,
            _csr_pem: &str,
        ) -> Result<(CertificateRegistration, String), RegistryError> {
            unimplemented!("not exercised here")
        }

        fn describe_thing(&self, _name: &str) -> Result<Option<ThingRecord>, RegistryError> {
            unimplemented!("not exercised here")
        }

        fn create_thing(&self, _name: &str) -> Result<ThingRecord, RegistryError> {
            unimplemented!("not exercised here")
        }

        fn attach_thing_principal(
            &self,
            _thing: &str,
            _principal: &CertificateRef,
        ) -> Result<(), RegistryError> {
            unimplemented!("not exercised here")
        }

        fn get_policy(&self, name: &str) -> Result<Option<PolicyRecord>, RegistryError> {
            Ok(self
                .policies
                .lock()
                .unwrap()
                .get(name)
                .map(|document| PolicyRecord {
                    name: name.to_string(),
                    document: document.clone(),
                }))
        }

        fn create_policy(&self, name: &str, document: &str) -> Result<(), RegistryError> {
            *self.creates.lock().unwrap() += 1;
            if self.create_races {
                return Err(RegistryError::AlreadyExists(format!("policy [{}]", name)));
            }
            self.policies
                .lock()
                .unwrap()
                .insert(name.to_string(), document.to_string());
            Ok(())
        }

        fn attach_policy(
            &self,
            name: &str,
            target: &CertificateRef,
        ) -> Result<(), RegistryError> {
            if self.fail_attach {
                return Err(RegistryError::Backend("attach refused".to_string()));
            }
            self.attachments
                .lock()
                .unwrap()
                .push((name.to_string(), target.0.clone()));
            Ok(())
        }

        fn describe_endpoint(&self) -> Result<String, RegistryError> {
            unimplemented!("not exercised here")
        }
    }

    fn cert(n: u32) -> CertificateRef {
        CertificateRef(format!("arn:registry:cert/{:04}", n))
    }

    #[test]
    fn test_bind_creates_policy_once_attaches_twice() {
        let registry = FakeRegistry::default();
        let binder = PolicyBinder::new(&registry, "widgiot", "us-east-1", "123456789012");

        binder.bind(&cert(1)).unwrap();
        binder.bind(&cert(2)).unwrap();

        assert_eq!(*registry.creates.lock().unwrap(), 1);
        let attachments = registry.attachments.lock().unwrap();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].0, "widgiot");
        assert_ne!(attachments[0].1, attachments[1].1);
    }

    #[test]
    fn test_creation_race_is_tolerated() {
        let registry = FakeRegistry {
            create_races: true,
            ..FakeRegistry::default()
        };
        let binder = PolicyBinder::new(&registry, "widgiot", "us-east-1", "123456789012");

        binder.bind(&cert(1)).unwrap();
        assert_eq!(registry.attachments.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_attach_failure_is_hard() {
        let registry = FakeRegistry {
            fail_attach: true,
            ..FakeRegistry::default()
        };
        let binder = PolicyBinder::new(&registry, "widgiot", "us-east-1", "123456789012");

        let result = binder.bind(&cert(1));
        assert!(matches!(result, Err(CbError::PolicyBindFailed(_))));
    }

    #[test]
    fn test_template_scopes_resources() {
        let document = render_policy_document("eu-west-1", "999999999999");
        let parsed: serde_json::Value = serde_json::from_str(&document).unwrap();

        assert_eq!(parsed["Version"], "2012-10-17");
        let statements = parsed["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 3);

        for statement in statements {
            assert_eq!(statement["Effect"], "Allow");
            for resource in statement["Resource"].as_array().unwrap() {
                let arn = resource.as_str().unwrap();
                assert!(arn.contains(":eu-west-1:999999999999:"), "unscoped arn: {}", arn);
                assert!(arn.contains("${iot:Connection.Thing.ThingName}"));
            }
        }
    }

    #[test]
    fn test_template_grants_own_identity_only() {
        let document = render_policy_document("us-east-1", "123456789012");

        // No wildcard client or bare topic grants.
        assert!(!document.contains(":client/*"));
        assert!(!document.contains(":topic/*"));
    }
}
