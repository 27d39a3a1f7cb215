//! Challenge-response authentication
//!
//! Every connection receives a fresh, single-use challenge before it may send
//! anything but its `connect` request. The client proves possession of the
//! gateway secret by returning an HMAC-SHA256 over the challenge and the
//! identity it claims; the verifier is pluggable behind [`ResponseVerifier`].
//!
//! Pending challenges are consumed on the first verification attempt,
//! successful or not, so concurrent or replayed attempts resolve to at most
//! one success.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use super::{timing_safe_eq, Role};

type HmacSha256 = Hmac<Sha256>;

/// Default maximum challenge age (matches the default handshake timeout).
pub const DEFAULT_CHALLENGE_MAX_AGE: Duration = Duration::from_secs(10);

/// Nonce length in bytes (before base64 encoding)
const NONCE_BYTES: usize = 32;

/// Domain separator mixed into every signed payload.
const SIGNATURE_DOMAIN: &str = "clawgate-connect:v1";

/// Verification failures. Detailed for internal logs only; the wire only
/// ever sees a generic "authentication failed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("challenge not found or already consumed")]
    ChallengeNotFound,

    #[error("challenge expired after {age_ms}ms")]
    ChallengeExpired { age_ms: u64 },

    #[error("challenge response mismatch")]
    ResponseMismatch,

    #[error("secure random source unavailable: {0}")]
    RandomSource(String),
}

/// Challenge authentication settings.
#[derive(Clone)]
pub struct ChallengeConfig {
    /// When false, challenges carry a plain nonce without cryptographic
    /// binding. Only for trusted loopback deployments.
    pub enabled: bool,
    /// Shared secret used for the HMAC construction.
    pub secret: Option<String>,
    /// Maximum age before an issued challenge is rejected as expired.
    pub max_age: Duration,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret: None,
            max_age: DEFAULT_CHALLENGE_MAX_AGE,
        }
    }
}

impl fmt::Debug for ChallengeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeConfig")
            .field("enabled", &self.enabled)
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("max_age", &self.max_age)
            .finish()
    }
}

/// An issued challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub nonce: String,
    pub issued_at: Instant,
    pub issued_at_ms: u64,
}

/// Identity a client claims in its `connect` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectClaims {
    pub client_id: String,
    pub role: Role,
}

/// Identity established by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub client_id: String,
    pub role: Role,
}

/// Pluggable `verify(challenge, response) -> bool` construction.
pub trait ResponseVerifier: Send + Sync + fmt::Debug {
    /// Algorithm label advertised in the `connect.challenge` event.
    fn algorithm(&self) -> &'static str;

    fn verify(&self, challenge: &Challenge, claims: &ConnectClaims, response: &str) -> bool;
}

/// Default verifier: HMAC-SHA256 keyed with the gateway secret.
///
/// An empty secret rejects every response.
pub struct HmacSha256Verifier {
    secret: Vec<u8>,
}

impl HmacSha256Verifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }
}

impl fmt::Debug for HmacSha256Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSha256Verifier")
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

impl ResponseVerifier for HmacSha256Verifier {
    fn algorithm(&self) -> &'static str {
        "hmac-sha256"
    }

    fn verify(&self, challenge: &Challenge, claims: &ConnectClaims, response: &str) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        let Ok(provided) = decode_response(response) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(signing_payload(&challenge.id, &challenge.nonce, claims).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }
}

/// Degraded verifier: the client echoes the nonce back.
#[derive(Debug, Default)]
pub struct PlainNonceVerifier;

impl ResponseVerifier for PlainNonceVerifier {
    fn algorithm(&self) -> &'static str {
        "nonce"
    }

    fn verify(&self, challenge: &Challenge, _claims: &ConnectClaims, response: &str) -> bool {
        timing_safe_eq(response.trim(), &challenge.nonce)
    }
}

/// Canonical payload covered by the HMAC.
pub fn signing_payload(challenge_id: &str, nonce: &str, claims: &ConnectClaims) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        SIGNATURE_DOMAIN,
        challenge_id,
        nonce,
        claims.client_id,
        claims.role.as_str(),
        claims.role.node_id().unwrap_or_default()
    )
}

/// Compute the response a client must send for a challenge.
pub fn sign_response(
    secret: &[u8],
    challenge_id: &str,
    nonce: &str,
    claims: &ConnectClaims,
) -> Result<String, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::ResponseMismatch)?;
    mac.update(signing_payload(challenge_id, nonce, claims).as_bytes());
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

fn decode_response(input: &str) -> Result<Vec<u8>, ()> {
    let input = input.trim();
    if let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.as_bytes()) {
        return Ok(bytes);
    }
    base64::engine::general_purpose::STANDARD
        .decode(input.as_bytes())
        .map_err(|_| ())
}

fn generate_nonce() -> Result<String, AuthError> {
    let mut bytes = [0u8; NONCE_BYTES];
    getrandom::fill(&mut bytes).map_err(|e| AuthError::RandomSource(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Issues and verifies single-use, time-bounded challenges.
#[derive(Debug)]
pub struct ChallengeAuthenticator {
    verifier: Arc<dyn ResponseVerifier>,
    max_age: Duration,
    degraded: bool,
    pending: Mutex<HashMap<String, Challenge>>,
}

impl ChallengeAuthenticator {
    pub fn new(verifier: Arc<dyn ResponseVerifier>, max_age: Duration) -> Self {
        Self {
            verifier,
            max_age,
            degraded: false,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Build from configuration. Disabled challenge auth selects the plain
    /// nonce verifier and marks the authenticator as degraded.
    pub fn from_config(config: &ChallengeConfig) -> Self {
        if !config.enabled {
            return Self {
                degraded: true,
                ..Self::new(Arc::new(PlainNonceVerifier), config.max_age)
            };
        }
        let secret = config.secret.clone().unwrap_or_default();
        Self::new(Arc::new(HmacSha256Verifier::new(secret)), config.max_age)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn algorithm(&self) -> &'static str {
        self.verifier.algorithm()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Issue a fresh challenge and record it as pending.
    pub fn issue(&self) -> Result<Challenge, AuthError> {
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            nonce: generate_nonce()?,
            issued_at: Instant::now(),
            issued_at_ms: now_ms(),
        };
        let mut pending = self.pending.lock();
        let max_age = self.max_age;
        pending.retain(|_, c| c.issued_at.elapsed() <= max_age);
        pending.insert(challenge.id.clone(), challenge.clone());
        Ok(challenge)
    }

    /// Verify a response, consuming the challenge.
    ///
    /// The challenge is removed before any check runs, so a second attempt
    /// for the same id always fails with [`AuthError::ChallengeNotFound`].
    pub fn verify(
        &self,
        challenge_id: &str,
        claims: &ConnectClaims,
        response: &str,
    ) -> Result<VerifiedIdentity, AuthError> {
        let challenge = self
            .pending
            .lock()
            .remove(challenge_id)
            .ok_or(AuthError::ChallengeNotFound)?;

        let age = challenge.issued_at.elapsed();
        if age > self.max_age {
            return Err(AuthError::ChallengeExpired {
                age_ms: age.as_millis() as u64,
            });
        }

        if !self.verifier.verify(&challenge, claims, response) {
            return Err(AuthError::ResponseMismatch);
        }

        Ok(VerifiedIdentity {
            client_id: claims.client_id.clone(),
            role: claims.role.clone(),
        })
    }

    /// Drop a pending challenge (connection torn down before verifying).
    pub fn discard(&self, challenge_id: &str) -> bool {
        self.pending.lock().remove(challenge_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &str = "test-gateway-secret";

    fn authenticator() -> ChallengeAuthenticator {
        ChallengeAuthenticator::from_config(&ChallengeConfig {
            enabled: true,
            secret: Some(SECRET.to_string()),
            max_age: Duration::from_secs(10),
        })
    }

    fn operator_claims() -> ConnectClaims {
        ConnectClaims {
            client_id: "cli".to_string(),
            role: Role::Interactive,
        }
    }

    fn respond(challenge: &Challenge, claims: &ConnectClaims) -> String {
        sign_response(SECRET.as_bytes(), &challenge.id, &challenge.nonce, claims).unwrap()
    }

    #[test]
    fn test_issue_generates_unique_challenges() {
        let auth = authenticator();
        let a = auth.issue().unwrap();
        let b = auth.issue().unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.nonce, b.nonce);
        // 32 random bytes, base64url without padding
        assert_eq!(a.nonce.len(), 43);
        assert_eq!(auth.pending_count(), 2);
    }

    #[test]
    fn test_valid_response_succeeds_once() {
        let auth = authenticator();
        let challenge = auth.issue().unwrap();
        let claims = operator_claims();
        let response = respond(&challenge, &claims);

        let identity = auth.verify(&challenge.id, &claims, &response).unwrap();
        assert_eq!(identity.client_id, "cli");
        assert_eq!(identity.role, Role::Interactive);

        // Replay of the same challenge fails.
        assert_eq!(
            auth.verify(&challenge.id, &claims, &response),
            Err(AuthError::ChallengeNotFound)
        );
        assert_eq!(auth.pending_count(), 0);
    }

    #[test]
    fn test_unknown_challenge_rejected() {
        let auth = authenticator();
        let claims = operator_claims();
        assert_eq!(
            auth.verify("never-issued", &claims, "whatever"),
            Err(AuthError::ChallengeNotFound)
        );
    }

    #[test]
    fn test_mismatch_consumes_challenge() {
        let auth = authenticator();
        let challenge = auth.issue().unwrap();
        let claims = operator_claims();

        assert_eq!(
            auth.verify(&challenge.id, &claims, "bm90LWEtbWFj"),
            Err(AuthError::ResponseMismatch)
        );
        // A correct response afterwards cannot resurrect it.
        let response = respond(&challenge, &claims);
        assert_eq!(
            auth.verify(&challenge.id, &claims, &response),
            Err(AuthError::ChallengeNotFound)
        );
    }

    #[test]
    fn test_response_bound_to_claimed_role() {
        let auth = authenticator();
        let challenge = auth.issue().unwrap();
        let signed_as_operator = respond(&challenge, &operator_claims());
        let node_claims = ConnectClaims {
            client_id: "cli".to_string(),
            role: Role::Node("node-7".to_string()),
        };
        assert_eq!(
            auth.verify(&challenge.id, &node_claims, &signed_as_operator),
            Err(AuthError::ResponseMismatch)
        );
    }

    #[test]
    fn test_expired_challenge_rejected() {
        let auth = ChallengeAuthenticator::from_config(&ChallengeConfig {
            enabled: true,
            secret: Some(SECRET.to_string()),
            max_age: Duration::from_millis(20),
        });
        let challenge = auth.issue().unwrap();
        let claims = operator_claims();
        let response = respond(&challenge, &claims);
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(
            auth.verify(&challenge.id, &claims, &response),
            Err(AuthError::ChallengeExpired { .. })
        ));
    }

    #[test]
    fn test_missing_secret_rejects_everything() {
        let auth = ChallengeAuthenticator::from_config(&ChallengeConfig::default());
        let challenge = auth.issue().unwrap();
        let claims = operator_claims();
        let response = sign_response(b"", &challenge.id, &challenge.nonce, &claims).unwrap();
        assert_eq!(
            auth.verify(&challenge.id, &claims, &response),
            Err(AuthError::ResponseMismatch)
        );
    }

    #[test]
    fn test_degraded_mode_echoes_nonce() {
        let auth = ChallengeAuthenticator::from_config(&ChallengeConfig {
            enabled: false,
            secret: None,
            max_age: Duration::from_secs(10),
        });
        assert!(auth.is_degraded());
        assert_eq!(auth.algorithm(), "nonce");

        let challenge = auth.issue().unwrap();
        let claims = operator_claims();
        assert!(auth.verify(&challenge.id, &claims, &challenge.nonce).is_ok());

        let other = auth.issue().unwrap();
        assert_eq!(
            auth.verify(&other.id, &claims, "wrong"),
            Err(AuthError::ResponseMismatch)
        );
    }

    #[test]
    fn test_standard_base64_response_accepted() {
        let auth = authenticator();
        let challenge = auth.issue().unwrap();
        let claims = operator_claims();
        let url_safe = respond(&challenge, &claims);
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(url_safe.as_bytes())
            .unwrap();
        let standard = base64::engine::general_purpose::STANDARD.encode(raw);
        assert!(auth.verify(&challenge.id, &claims, &standard).is_ok());
    }

    #[test]
    fn test_discard_removes_pending() {
        let auth = authenticator();
        let challenge = auth.issue().unwrap();
        assert!(auth.discard(&challenge.id));
        assert!(!auth.discard(&challenge.id));
        assert_eq!(auth.pending_count(), 0);
    }

    #[test]
    fn test_concurrent_verification_single_winner() {
        let auth = Arc::new(authenticator());
        let challenge = auth.issue().unwrap();
        let claims = operator_claims();
        let response = respond(&challenge, &claims);
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let auth = auth.clone();
                let id = challenge.id.clone();
                let claims = claims.clone();
                let response = response.clone();
                let successes = successes.clone();
                std::thread::spawn(move || {
                    if auth.verify(&id, &claims, &response).is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_config_debug_redacts_secret() {
        let config = ChallengeConfig {
            secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[redacted]"));
    }
}
