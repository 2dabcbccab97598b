//! Certificate authority client.
//!
//! The CA signs asynchronously: a submission returns a reference, and the
//! signed certificate becomes retrievable some time later. `CaClient`
//! drives that cycle: submit once, then poll with bounded backoff until
//! the certificate is ready or the budget is exhausted. This is the only
//! component in the crate permitted to block between external calls.
//!
//! Every submission carries a freshly generated idempotency token. Reusing
//! a token across logically distinct requests makes the CA deduplicate
//! genuinely different issuances, so tokens are never cached or shared.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::csr::{DecodedCsr, KeyAlgorithm};
use crate::error::CbError;

/// Signing algorithm requested from the CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Sha256WithEcdsa,
    Sha384WithEcdsa,
    Sha256WithRsa,
}

impl SigningAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            SigningAlgorithm::Sha256WithEcdsa => "SHA256WITHECDSA",
            SigningAlgorithm::Sha384WithEcdsa => "SHA384WITHECDSA",
            SigningAlgorithm::Sha256WithRsa => "SHA256WITHRSA",
        }
    }

    /// Default algorithm for a CSR key family.
    pub fn for_key(key: KeyAlgorithm) -> Self {
        match key {
            KeyAlgorithm::Ec => SigningAlgorithm::Sha256WithEcdsa,
            KeyAlgorithm::Rsa => SigningAlgorithm::Sha256WithRsa,
        }
    }

    /// Parse a configured algorithm name.
    pub fn parse(name: &str) -> Result<Self, CbError> {
        match name.to_ascii_uppercase().as_str() {
            "SHA256WITHECDSA" => Ok(SigningAlgorithm::Sha256WithEcdsa),
            "SHA384WITHECDSA" => Ok(SigningAlgorithm::Sha384WithEcdsa),
            "SHA256WITHRSA" => Ok(SigningAlgorithm::Sha256WithRsa),
            other => Err(CbError::ConfigError(format!(
                "unrecognized signing algorithm [{}]",
                other
            ))),
        }
    }
}

const TOKEN_LEN: usize = 10;

/// A caller-supplied deduplication token, unique per logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Generate a fresh token from OS entropy.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        getrandom::fill(&mut bytes).expect("getrandom failed");
        let token = bytes.iter().map(|b| char::from(b'a' + b % 26)).collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Authority-assigned reference to a submitted issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRef(pub String);

impl fmt::Display for IssuanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters of one issuance submission.
#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    pub authority_ref: String,
    pub csr_pem: String,
    pub signing_algorithm: SigningAlgorithm,
    pub validity_days: u32,
    pub idempotency_token: String,
}

/// Outcome of one retrieval attempt.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The signed certificate, PEM-encoded.
    Ready(String),
    /// The CA has not finished signing; retry later.
    NotReady,
}

/// The asynchronous certificate authority seam.
pub trait CertificateAuthority {
    /// Submit a CSR for signing; returns the issuance reference.
    fn submit(&self, request: &IssuanceRequest) -> Result<IssuanceRef, CbError>;

    /// Attempt to retrieve the signed certificate for a prior submission.
    fn fetch(&self, reference: &IssuanceRef) -> Result<FetchOutcome, CbError>;
}

/// Bounded retrieval poll: geometric backoff under a hard deadline.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Delay before the second retrieval attempt.
    pub initial_delay: Duration,
    /// Cap for backoff growth.
    pub max_delay: Duration,
    /// Multiplier for successive delays.
    pub multiplier: f64,
    /// Maximum retrieval attempts.
    pub max_attempts: u32,
    /// Hard ceiling on total elapsed time. Keep this safely below any
    /// execution deadline the host runtime enforces.
    pub overall_deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            max_attempts: 10,
            overall_deadline: Duration::from_secs(20),
        }
    }
}

impl PollPolicy {
    /// Delay before retrieval attempt `attempt` (1-indexed; the first
    /// attempt happens immediately after submission).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 2);
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}

/// The signed result of a completed issuance.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub reference: IssuanceRef,
    pub certificate_pem: String,
}

/// Drives submission and bounded retrieval against a certificate authority.
pub struct CaClient<'a> {
    authority: &'a dyn CertificateAuthority,
    poll: PollPolicy,
}

impl<'a> CaClient<'a> {
    pub fn new(authority: &'a dyn CertificateAuthority) -> Self {
        Self {
            authority,
            poll: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Issue a certificate for a decoded CSR.
    ///
    /// Submits exactly once with a fresh idempotency token, then polls for
    /// the result. Only a `NotReady` outcome is retried; any other CA error
    /// propagates immediately. Exhausting the poll budget fails with
    /// `IssuanceTimeout`; the submission itself is not retried, so a retry
    /// by the caller cannot silently duplicate certificates.
    pub fn issue(
        &self,
        csr: &DecodedCsr,
        authority_ref: &str,
        validity_days: u32,
        algorithm: SigningAlgorithm,
    ) -> Result<IssuedCertificate, CbError> {
        let token = IdempotencyToken::generate();
        let request = IssuanceRequest {
            authority_ref: authority_ref.to_string(),
            csr_pem: csr.pem().to_string(),
            signing_algorithm: algorithm,
            validity_days,
            idempotency_token: token.as_str().to_string(),
        };

        let reference = self.authority.submit(&request)?;
        log::info!(
            "issuance submitted for device [{}]: {}",
            csr.identity(),
            reference
        );

        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let delay = self.poll.delay_for_attempt(attempts);
            if !delay.is_zero() {
                if started.elapsed() + delay > self.poll.overall_deadline {
                    return Err(CbError::IssuanceTimeout {
                        attempts: attempts - 1,
                        waited: started.elapsed(),
                    });
                }
                thread::sleep(delay);
            }

            match self.authority.fetch(&reference)? {
                FetchOutcome::Ready(certificate_pem) => {
                    log::info!("certificate ready after {} attempts: {}", attempts, reference);
                    return Ok(IssuedCertificate {
                        reference,
                        certificate_pem,
                    });
                }
                FetchOutcome::NotReady => {
                    log::debug!(
                        "certificate not ready yet (attempt {} of {})",
                        attempts,
                        self.poll.max_attempts
                    );
                    if attempts >= self.poll.max_attempts {
                        return Err(CbError::IssuanceTimeout {
                            attempts,
                            waited: started.elapsed(),
                        });
                    }
                }
            }
        }
    }
}

/// HTTP certificate authority client.
///
/// Wire contract:
/// - `POST {base}/certificates` with the submission body returns
///   `{"certificateArn": ...}`.
/// - `POST {base}/certificates/fetch` with `{"certificateArn": ...}`
///   returns 200 `{"certificate": <PEM>}` once signed, 202 (or an error
///   body with code `RequestInProgress`) while signing is in flight.
pub struct HttpCaClient {
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    #[serde(rename = "certificateAuthorityArn")]
    certificate_authority_arn: &'a str,
    /// Base64 of the PEM CSR, so the body survives JSON transport intact.
    csr: String,
    #[serde(rename = "signingAlgorithm")]
    signing_algorithm: &'a str,
    #[serde(rename = "validityDays")]
    validity_days: u32,
    #[serde(rename = "idempotencyToken")]
    idempotency_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "certificateArn")]
    certificate_arn: String,
}

#[derive(Debug, Serialize)]
struct FetchBody<'a> {
    #[serde(rename = "certificateArn")]
    certificate_arn: &'a str,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct CaErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl HttpCaClient {
    /// Create a client for a CA service at `base_url` (no trailing slash).
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

    fn post_json(&self, url: &str, body: &str) -> Result<(u16, String), CbError> {
        let response = self
            .agent
            .post(url)
            .header("Content-Type", "application/json")
            .send(body.as_bytes())
            .map_err(|e| CbError::IssuanceFailed(format!("request to CA failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| CbError::IssuanceFailed(format!("failed to read CA response: {}", e)))?;

        Ok((status, body))
    }
}

impl CertificateAuthority for HttpCaClient {
    fn submit(&self, request: &IssuanceRequest) -> Result<IssuanceRef, CbError> {
        let url = format!("{}/certificates", self.base_url);
        let body = SubmitBody {
            certificate_authority_arn: &request.authority_ref,
            csr: BASE64.encode(request.csr_pem.as_bytes()),
            signing_algorithm: request.signing_algorithm.as_str(),
            validity_days: request.validity_days,
            idempotency_token: &request.idempotency_token,
        };
        let json = serde_json::to_string(&body)
            .map_err(|e| CbError::IssuanceFailed(format!("failed to serialize request: {}", e)))?;

        let (status, body) = self.post_json(&url, &json)?;
        if status != 200 && status != 201 {
            return Err(CbError::IssuanceFailed(format!(
                "CA returned status {}: {}",
                status, body
            )));
        }

        let parsed: SubmitResponse = serde_json::from_str(&body)
            .map_err(|e| CbError::IssuanceFailed(format!("failed to parse CA response: {}", e)))?;

        Ok(IssuanceRef(parsed.certificate_arn))
    }

    fn fetch(&self, reference: &IssuanceRef) -> Result<FetchOutcome, CbError> {
        let url = format!("{}/certificates/fetch", self.base_url);
        let body = FetchBody {
            certificate_arn: &reference.0,
        };
        let json = serde_json::to_string(&body)
            .map_err(|e| CbError::IssuanceFailed(format!("failed to serialize request: {}", e)))?;

        let (status, body) = self.post_json(&url, &json)?;

        if status == 200 {
            let parsed: FetchResponse = serde_json::from_str(&body).map_err(|e| {
                CbError::IssuanceFailed(format!("failed to parse CA response: {}", e))
            })?;
            return Ok(FetchOutcome::Ready(parsed.certificate));
        }

        if status == 202 {
            return Ok(FetchOutcome::NotReady);
        }

        // Some authorities signal in-flight signing through an error body
        // rather than a status code.
        if let Ok(err) = serde_json::from_str::<CaErrorBody>(&body) {
            if err.code.as_deref() == Some("RequestInProgress") {
                return Ok(FetchOutcome::NotReady);
            }
            if let (Some(code), Some(message)) = (err.code, err.message) {
                return Err(CbError::IssuanceFailed(format!(
                    "CA returned {}: {}: {}",
                    status, code, message
                )));
            }
        }

        Err(CbError::IssuanceFailed(format!(
            "CA returned status {}: {}",
            status, body
        )))
    }
}
