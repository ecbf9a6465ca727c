use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;

use super::keys::KeyCache;
use super::AuthError;

/// Asymmetric algorithms a token may be signed with.
pub const ACCEPTED_ALGORITHMS: &[&str] = &[
    "RS256", "RS384", "RS512", "PS256", "PS384", "PS512", "ES256", "ES384", "EdDSA",
];

const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Map a header `alg` onto an accepted asymmetric algorithm.
pub fn validate_algorithm(alg: &str) -> Result<Algorithm, AuthError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|f| f.eq_ignore_ascii_case(alg)) {
        return Err(AuthError::UnsupportedAlgorithm(format!(
            "'{}' is not an asymmetric algorithm",
            alg
        )));
    }
    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(AuthError::UnsupportedAlgorithm(format!("'{}' is not accepted", alg)));
    }
    Algorithm::from_str(alg).map_err(|_| AuthError::UnsupportedAlgorithm(alg.to_string()))
}

/// Subject of a verified token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AuthenticatedIdentity(String);

impl AuthenticatedIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AuthenticatedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: Option<String>,
    kid: Option<String>,
}

#[derive(Deserialize)]
struct Claims {
    sub: Option<String>,
    iss: Option<String>,
    exp: Option<i64>,
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str, what: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::ClaimsMalformed(format!("{} is not base64url: {}", what, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::ClaimsMalformed(format!("{} is not valid JSON: {}", what, e)))
}

/// Verifies bearer tokens against a shared [`KeyCache`].
pub struct TokenVerifier {
    keys: Arc<KeyCache>,
    issuer: String,
}

impl TokenVerifier {
    pub fn new(keys: Arc<KeyCache>, issuer: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
        }
    }

    pub fn keys(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verify `token` and return its subject.
    ///
    /// Cheap structural checks (algorithm, expiry, issuer) run on the
    /// unverified payload first so an expired token is reported as expired
    /// whatever its signature. The signature is then checked with
    /// `jsonwebtoken` against the key named by `kid`.
    pub async fn verify(&self, token: &str) -> Result<AuthenticatedIdentity, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(_sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::ClaimsMalformed("token must have three segments".into()));
        };

        let header: RawHeader = decode_segment(header_b64, "header")?;
        let alg = header
            .alg
            .ok_or_else(|| AuthError::ClaimsMalformed("header has no 'alg'".into()))?;
        let algorithm = validate_algorithm(&alg)?;
        let kid = header
            .kid
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AuthError::ClaimsMalformed("header has no 'kid'".into()))?;

        let claims: Claims = decode_segment(payload_b64, "payload")?;
        let exp = claims
            .exp
            .ok_or_else(|| AuthError::ClaimsMalformed("missing claim 'exp'".into()))?;
        if exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::TokenExpired);
        }
        let iss = claims
            .iss
            .ok_or_else(|| AuthError::ClaimsMalformed("missing claim 'iss'".into()))?;
        if iss != self.issuer {
            return Err(AuthError::IssuerMismatch(iss));
        }

        let mut set = self.keys.current().await?;
        if set.get(&kid).is_none() {
            set = match self.keys.refresh_for_unknown_kid(&kid).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::warn!(kid = %kid, error = %e, "key set refresh for unknown kid failed");
                    return Err(AuthError::UnknownSigningKey { kid });
                }
            };
        }
        let Some(key) = set.get(&kid) else {
            return Err(AuthError::UnknownSigningKey { kid });
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        let data = jsonwebtoken::decode::<Claims>(token, key, &validation)?;

        match data.claims.sub {
            Some(sub) if !sub.is_empty() => Ok(AuthenticatedIdentity(sub)),
            _ => Err(AuthError::ClaimsMalformed("empty subject".into())),
        }
    }
}
