//! Token verification against the identity provider's rotating key set.
//!
//! [`KeyCache`] owns the current [`KeySet`] snapshot and decides when to
//! reload it; [`TokenVerifier`] checks bearer tokens against it.

use thiserror::Error;

pub mod keys;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testutil;

pub use keys::{HttpKeySource, KeyCache, KeySet, KeySetOrigin, KeySource, RefreshPolicy, KEYSET_CACHE_KEY};
pub use verifier::{validate_algorithm, AuthenticatedIdentity, TokenVerifier, ACCEPTED_ALGORITHMS};

/// Reasons a bearer token is refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Header `kid` does not resolve, even after one refresh.
    #[error("signing key '{kid}' is not in the current key set")]
    UnknownSigningKey { kid: String },

    /// Symmetric, `none`, or otherwise unaccepted algorithm.
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token issuer '{0}' does not match")]
    IssuerMismatch(String),

    #[error("token expired")]
    TokenExpired,

    /// Token structure, header, or claims could not be decoded.
    #[error("malformed token: {0}")]
    ClaimsMalformed(String),

    #[error("invalid token signature")]
    InvalidSignature,

    /// No key set could be obtained from cache or origin.
    #[error("key set unavailable: {0}")]
    BackendUnavailable(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidIssuer => AuthError::IssuerMismatch("issuer validation failed".into()),
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                AuthError::UnsupportedAlgorithm("algorithm does not match key".into())
            }
            ErrorKind::MissingRequiredClaim(claim) => {
                AuthError::ClaimsMalformed(format!("missing claim '{}'", claim))
            }
            _ => AuthError::ClaimsMalformed(err.to_string()),
        }
    }
}

impl AuthError {
    /// Short stable label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::UnknownSigningKey { .. } => "unknown_signing_key",
            AuthError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            AuthError::IssuerMismatch(_) => "issuer_mismatch",
            AuthError::TokenExpired => "token_expired",
            AuthError::ClaimsMalformed(_) => "claims_malformed",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::BackendUnavailable(_) => "backend_unavailable",
        }
    }
}
