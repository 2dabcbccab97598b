//! CSR decoding.
//!
//! The front door delivers a base64-encoded PEM PKCS#10 certificate signing
//! request in a request header. This module decodes the transport encoding,
//! parses the request, and extracts the claimed device identity (Subject
//! Common Name) together with the embedded public key. Both the authorizer
//! and the provisioning entry points consume this one capability; neither
//! re-implements any parsing.
//!
//! Decoding is pure and synchronous. Every failure mode (bad base64, bad
//! PEM, a PEM block that is not a certificate request, undecodable DER, a
//! missing or invalid Subject CN, an unsupported key type) is reported as
//! `CbError::MalformedRequest` and must abort the calling workflow before
//! any external service is contacted.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use x509_parser::prelude::*;

use crate::device::DeviceIdentity;
use crate::error::CbError;

/// PEM tag required on the decoded block.
const CSR_PEM_TAG: &str = "CERTIFICATE REQUEST";

/// Public key family of the CSR's SubjectPublicKeyInfo.
///
/// Drives signing-algorithm selection when no explicit algorithm is
/// configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ec,
    Rsa,
}

/// A decoded certificate signing request.
///
/// Immutable once constructed; the original PEM text is retained verbatim
/// for submission to the certificate authority.
#[derive(Debug, Clone)]
pub struct DecodedCsr {
    identity: DeviceIdentity,
    key_algorithm: KeyAlgorithm,
    public_key_der: Vec<u8>,
    pem: String,
}

impl DecodedCsr {
    /// Decode a base64-transport-encoded PEM CSR from a request envelope.
    pub fn from_transport(encoded: &str) -> Result<Self, CbError> {
        let raw = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|e| CbError::MalformedRequest(format!("invalid base64 payload: {}", e)))?;

        let pem_text = String::from_utf8(raw).map_err(|e| {
            CbError::MalformedRequest(format!("decoded payload is not UTF-8: {}", e))
        })?;

        Self::from_pem(&pem_text)
    }

    /// Parse a PEM-encoded PKCS#10 certificate signing request.
    pub fn from_pem(pem_text: &str) -> Result<Self, CbError> {
        let block = ::pem::parse(pem_text)
            .map_err(|e| CbError::MalformedRequest(format!("invalid PEM: {}", e)))?;

        if block.tag() != CSR_PEM_TAG {
            return Err(CbError::MalformedRequest(format!(
                "expected a {} block, found {}",
                CSR_PEM_TAG,
                block.tag()
            )));
        }

        let (_, request) = X509CertificationRequest::from_der(block.contents())
            .map_err(|e| CbError::MalformedRequest(format!("invalid PKCS#10 request: {}", e)))?;

        let info = &request.certification_request_info;

        let common_name = info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| {
                CbError::MalformedRequest("subject has no common name".to_string())
            })?;

        let identity = DeviceIdentity::new(common_name)?;

        let spki = &info.subject_pki;
        let key_algorithm = if spki.algorithm.algorithm == x509_parser::oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY
        {
            KeyAlgorithm::Ec
        } else if spki.algorithm.algorithm == x509_parser::oid_registry::OID_PKCS1_RSAENCRYPTION {
            KeyAlgorithm::Rsa
        } else {
            return Err(CbError::MalformedRequest(format!(
                "unsupported public key algorithm {}",
                spki.algorithm.algorithm
            )));
        };

        Ok(Self {
            identity,
            key_algorithm,
            public_key_der: spki.raw.to_vec(),
            pem: pem_text.to_string(),
        })
    }

    /// The claimed device identity (Subject Common Name).
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Family of the embedded public key.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    /// Raw DER SubjectPublicKeyInfo of the embedded public key.
    ///
    /// This is the canonical form used for key comparison; it is independent
    /// of whatever PEM wrapping the submitting encoder produced.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// The embedded public key re-encoded as canonical PEM.
    pub fn public_key_pem(&self) -> String {
        let block = ::pem::Pem::new("PUBLIC KEY", self.public_key_der.clone());
        ::pem::encode(&block)
    }

    /// The CSR exactly as received, PEM-encoded.
    pub fn pem(&self) -> &str {
        &self.pem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_csr_pem(common_name: &str) -> (String, rcgen::KeyPair) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key).unwrap();
        (csr.pem().unwrap(), key)
    }

    #[test]
    fn test_decode_valid_csr() {
        let (pem_text, key) = test_csr_pem("dev-001");
        let encoded = BASE64.encode(pem_text.as_bytes());

        let csr = DecodedCsr::from_transport(&encoded).unwrap();
        assert_eq!(csr.identity().as_str(), "dev-001");
        assert_eq!(csr.key_algorithm(), KeyAlgorithm::Ec);
        assert_eq!(csr.pem(), pem_text);

        // The canonical public key must match what the generator reports.
        assert_eq!(csr.public_key_der(), key.public_key_der().as_slice());
    }

    #[test]
    fn test_public_key_pem_roundtrip() {
        let (pem_text, _key) = test_csr_pem("dev-001");
        let csr = DecodedCsr::from_pem(&pem_text).unwrap();

        let key_pem = csr.public_key_pem();
        assert!(key_pem.contains("BEGIN PUBLIC KEY"));

        let reparsed = ::pem::parse(&key_pem).unwrap();
        assert_eq!(reparsed.contents(), csr.public_key_der());
    }

    #[test]
    fn test_malformed_base64_rejected() {
        let result = DecodedCsr::from_transport("!!!not base64!!!");
        assert!(matches!(result, Err(CbError::MalformedRequest(_))));
    }

    #[test]
    fn test_valid_base64_invalid_pem_rejected() {
        let encoded = BASE64.encode(b"hello, definitely not a csr");
        let result = DecodedCsr::from_transport(&encoded);
        assert!(matches!(result, Err(CbError::MalformedRequest(_))));
    }

    #[test]
    fn test_wrong_pem_tag_rejected() {
        // A syntactically valid PEM block of the wrong type.
        let block = ::pem::Pem::new("CERTIFICATE", vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let result = DecodedCsr::from_pem(&::pem::encode(&block));
        match result {
            Err(CbError::MalformedRequest(msg)) => assert!(msg.contains("CERTIFICATE REQUEST")),
            other => panic!("expected MalformedRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_der_rejected() {
        let block = ::pem::Pem::new(CSR_PEM_TAG, vec![0xde, 0xad, 0xbe, 0xef]);
        let result = DecodedCsr::from_pem(&::pem::encode(&block));
        assert!(matches!(result, Err(CbError::MalformedRequest(_))));
    }

    #[test]
    fn test_missing_common_name_rejected() {
        // Default params carry an empty distinguished name.
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::default();
        let csr_pem = params.serialize_request(&key).unwrap().pem().unwrap();

        let result = DecodedCsr::from_pem(&csr_pem);
        assert!(matches!(result, Err(CbError::MalformedRequest(_))));
    }

    #[test]
    fn test_invalid_identity_charset_rejected() {
        let (pem_text, _key) = test_csr_pem("dev 001 with spaces");
        let result = DecodedCsr::from_pem(&pem_text);
        assert!(matches!(result, Err(CbError::MalformedRequest(_))));
    }

    #[test]
    fn test_transport_encoding_tolerates_surrounding_whitespace() {
        let (pem_text, _key) = test_csr_pem("dev-001");
        let encoded = format!("\n  {}  \n", BASE64.encode(pem_text.as_bytes()));
        let csr = DecodedCsr::from_transport(&encoded).unwrap();
        assert_eq!(csr.identity().as_str(), "dev-001");
    }
}
