//! Thing resolution.
//!
//! Maps a device identity to its logical device record, creating the record
//! on first provisioning, and binds the issued certificate to it. On
//! reissuance the existing record is reused and re-bound; bindings are
//! additive, and detaching a previous certificate is the caller's business.

use crate::device::DeviceIdentity;
use crate::error::CbError;
use crate::registry::{CertificateRef, DeviceRegistry, RegistryError, ThingRecord};

/// Resolves and binds logical device records.
pub struct ThingResolver<'a> {
    registry: &'a dyn DeviceRegistry,
}

impl<'a> ThingResolver<'a> {
    pub fn new(registry: &'a dyn DeviceRegistry) -> Self {
        Self { registry }
    }

    /// Ensure a thing exists for `identity` and attach `certificate` to it.
    ///
    /// A lookup miss is not an error. Losing a creation race to a
    /// concurrent provision is tolerated; the record the other writer
    /// created is used. Everything else is `ThingResolutionFailed`.
    pub fn attach(
        &self,
        identity: &DeviceIdentity,
        certificate: &CertificateRef,
    ) -> Result<ThingRecord, CbError> {
        let thing = match self.registry.describe_thing(identity.as_str()) {
            Ok(Some(existing)) => {
                log::debug!("thing [{}] exists, reusing for reissuance", identity);
                existing
            }
            Ok(None) => {
                log::info!("thing [{}] does not exist, creating", identity);
                match self.registry.create_thing(identity.as_str()) {
                    Ok(created) => created,
                    Err(RegistryError::AlreadyExists(_)) => {
                        // Lost the creation race; the winner's record works.
                        self.registry
                            .describe_thing(identity.as_str())
                            .map_err(|e| {
                                CbError::ThingResolutionFailed(format!(
                                    "re-describing [{}] after creation race: {}",
                                    identity, e
                                ))
                            })?
                            .ok_or_else(|| {
                                CbError::ThingResolutionFailed(format!(
                                    "thing [{}] reported existing but cannot be described",
                                    identity
                                ))
                            })?
                    }
                    Err(e) => {
                        return Err(CbError::ThingResolutionFailed(format!(
                            "creating [{}]: {}",
                            identity, e
                        )))
                    }
                }
            }
            Err(e) => {
                return Err(CbError::ThingResolutionFailed(format!(
                    "looking up [{}]: {}",
                    identity, e
                )))
            }
        };

        self.registry
            .attach_thing_principal(&thing.name, certificate)
            .map_err(|e| {
                CbError::ThingResolutionFailed(format!(
                    "attaching [{}] to [{}]: {}",
                    certificate, identity, e
                ))
            })?;

        log::info!("certificate [{}] attached to thing [{}]", certificate, thing.name);
        Ok(thing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CertificateRegistration, PolicyRecord};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        describes: u32,
        creates: u32,
        attaches: u32,
    }

    struct FakeRegistry {
        existing: Option<ThingRecord>,
        create_result: Option<RegistryError>,
        attach_result: Option<RegistryError>,
        /// Simulates losing a creation race: after create_thing has been
        /// called, describe_thing starts returning the winner's record.
        appear_after_create: bool,
        counters: Mutex<Counters>,
    }

    impl FakeRegistry {
        fn empty() -> Self {
            Self {
                existing: None,
                create_result: None,
                attach_result: None,
                appear_after_create: false,
                counters: Mutex::new(Counters::default()),
            }
        }

        fn with_existing(name: &str) -> Self {
            Self {
                existing: Some(ThingRecord {
                    name: name.to_string(),
                    reference: format!("arn:registry:thing/{}", name),
                }),
                ..Self::empty()
            }
        }
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

        fn describe_thing(&self, name: &str) -> Result<Option<ThingRecord>, RegistryError> {
            let mut counters = self.counters.lock().unwrap();
            counters.describes += 1;
            if self.appear_after_create && counters.creates > 0 {
                return Ok(Some(ThingRecord {
                    name: name.to_string(),
                    reference: format!("arn:registry:thing/{}", name),
                }));
            }
            Ok(self.existing.clone().filter(|t| t.name == name))
        }

        fn create_thing(&self, name: &str) -> Result<ThingRecord, RegistryError> {
            self.counters.lock().unwrap().creates += 1;
            match &self.create_result {
                None => Ok(ThingRecord {
                    name: name.to_string(),
                    reference: format!("arn:registry:thing/{}", name),
                }),
                Some(RegistryError::AlreadyExists(msg)) => {
                    Err(RegistryError::AlreadyExists(msg.clone()))
                }
                Some(RegistryError::NotFound(msg)) => Err(RegistryError::NotFound(msg.clone())),
                Some(RegistryError::Backend(msg)) => Err(RegistryError::Backend(msg.clone())),
            }
        }

        fn attach_thing_principal(
            &self,
            _thing: &str,
            _principal: &CertificateRef,
        ) -> Result<(), RegistryError> {
            self.counters.lock().unwrap().attaches += 1;
            match &self.attach_result {
                None => Ok(()),
                Some(RegistryError::Backend(msg)) => Err(RegistryError::Backend(msg.clone())),
                Some(other) => Err(RegistryError::Backend(other.to_string())),
            }
        }

        fn get_policy(&self, _name: &str) -> Result<Option<PolicyRecord>, RegistryError> {
            unimplemented!("not exercised here")
        }

        fn create_policy(&self, _name: &str, _document: &str) -> Result<(), RegistryError> {
            unimplemented!("not exercised here")
        }

        fn attach_policy(
            &self,
            _name: &str,
            _target: &CertificateRef,
        ) -> Result<(), RegistryError> {
            unimplemented!("not exercised here")
        }

        fn describe_endpoint(&self) -> Result<String, RegistryError> {
            unimplemented!("not exercised here")
        }
    }

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(id).unwrap()
    }

    fn cert() -> CertificateRef {
        CertificateRef("arn:registry:cert/0001".to_string())
    }

    #[test]
    fn test_existing_thing_short_circuits_create() {
        let registry = FakeRegistry::with_existing("dev-001");
        let resolver = ThingResolver::new(&registry);

        let thing = resolver.attach(&identity("dev-001"), &cert()).unwrap();
        assert_eq!(thing.name, "dev-001");

        let counters = registry.counters.lock().unwrap();
        assert_eq!(counters.describes, 1);
        assert_eq!(counters.creates, 0);
        assert_eq!(counters.attaches, 1);
    }

    #[test]
    fn test_missing_thing_is_created() {
        let registry = FakeRegistry::empty();
        let resolver = ThingResolver::new(&registry);

        let thing = resolver.attach(&identity("dev-002"), &cert()).unwrap();
        assert_eq!(thing.name, "dev-002");

        let counters = registry.counters.lock().unwrap();
        assert_eq!(counters.creates, 1);
        assert_eq!(counters.attaches, 1);
    }

    #[test]
    fn test_creation_race_is_tolerated() {
        let registry = FakeRegistry {
            create_result: Some(RegistryError::AlreadyExists("thing".to_string())),
            appear_after_create: true,
            ..FakeRegistry::empty()
        };
        let resolver = ThingResolver::new(&registry);

        let thing = resolver.attach(&identity("dev-003"), &cert()).unwrap();
        assert_eq!(thing.name, "dev-003");
        assert_eq!(registry.counters.lock().unwrap().attaches, 1);
    }

    #[test]
    fn test_creation_race_with_vanishing_record_fails() {
        // create reports AlreadyExists but the record still cannot be
        // described; that is a genuine resolution failure, not a race.
        let registry = FakeRegistry {
            create_result: Some(RegistryError::AlreadyExists("thing".to_string())),
            ..FakeRegistry::empty()
        };
        let resolver = ThingResolver::new(&registry);

        let result = resolver.attach(&identity("dev-003"), &cert());
        assert!(matches!(result, Err(CbError::ThingResolutionFailed(_))));
    }

    #[test]
    fn test_create_backend_failure_aborts() {
        let registry = FakeRegistry {
            create_result: Some(RegistryError::Backend("quota exceeded".to_string())),
            ..FakeRegistry::empty()
        };
        let resolver = ThingResolver::new(&registry);

        let result = resolver.attach(&identity("dev-004"), &cert());
        match result {
            Err(CbError::ThingResolutionFailed(msg)) => assert!(msg.contains("quota exceeded")),
            other => panic!("expected ThingResolutionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_failure_aborts() {
        let registry = FakeRegistry {
            attach_result: Some(RegistryError::Backend("attachment refused".to_string())),
            ..FakeRegistry::with_existing("dev-005")
        };
        let resolver = ThingResolver::new(&registry);

        let result = resolver.attach(&identity("dev-005"), &cert());
        assert!(matches!(result, Err(CbError::ThingResolutionFailed(_))));
    }
}
