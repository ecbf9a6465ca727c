//! Signing helpers for auth tests: fixed-seed Ed25519 keys, JWKS documents
//! and a scriptable key source.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::keys::KeySource;
use super::AuthError;

pub const TEST_ISSUER: &str = "https://issuer.test";

// PKCS8 v1 wrapper for a raw Ed25519 seed.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

pub struct TestKey {
    pub kid: String,
    signing: SigningKey,
}

impl TestKey {
    pub fn from_seed(seed: u8, kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            signing: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn jwk(&self) -> Value {
        json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(self.signing.verifying_key().to_bytes()),
            "kid": self.kid,
            "alg": "EdDSA",
            "use": "sig",
        })
    }

    fn encoding_key(&self) -> EncodingKey {
        let mut der = PKCS8_ED25519_PREFIX.to_vec();
        der.extend_from_slice(&self.signing.to_bytes());
        EncodingKey::from_ed_der(&der)
    }

    /// Sign arbitrary claims with this key's `kid` in the header.
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key()).unwrap()
    }

    /// Token for `sub` from [`TEST_ISSUER`] expiring `exp_in` seconds from now.
    pub fn token(&self, sub: &str, exp_in: i64) -> String {
        self.sign(&json!({
            "sub": sub,
            "iss": TEST_ISSUER,
            "exp": chrono::Utc::now().timestamp() + exp_in,
        }))
    }
}

pub fn jwks_for(keys: &[&TestKey]) -> String {
    json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() }).to_string()
}

/// Hand-build a token with an arbitrary header, signature bytes included.
pub fn forge(header: &Value, claims: &Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"not-a-signature"),
    )
}

enum Behaviour {
    Serve(String),
    Fail,
    Slow(Duration),
}

/// [`KeySource`] whose answer can be changed mid-test; counts fetches.
pub struct StaticKeySource {
    behaviour: Mutex<Behaviour>,
    calls: AtomicUsize,
}

impl StaticKeySource {
    fn with(behaviour: Behaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn serving(doc: String) -> Self {
        Self::with(Behaviour::Serve(doc))
    }

    pub fn failing() -> Self {
        Self::with(Behaviour::Fail)
    }

    pub fn slow(delay: Duration) -> Self {
        Self::with(Behaviour::Slow(delay))
    }

    pub fn serve(&self, doc: String) {
        *self.behaviour.lock() = Behaviour::Serve(doc);
    }

    pub fn set_failing(&self) {
        *self.behaviour.lock() = Behaviour::Fail;
    }

    pub fn set_slow(&self, delay: Duration) {
        *self.behaviour.lock() = Behaviour::Slow(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<String, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match &*self.behaviour.lock() {
            Behaviour::Serve(doc) => Ok(doc.clone()),
            Behaviour::Fail => Err(None),
            Behaviour::Slow(d) => Err(Some(*d)),
        };
        match outcome {
            Ok(doc) => Ok(doc),
            Err(Some(delay)) => {
                tokio::time::sleep(delay).await;
                Err(AuthError::BackendUnavailable("slow source gave up".into()))
            }
            Err(None) => Err(AuthError::BackendUnavailable("source down".into())),
        }
    }
}
