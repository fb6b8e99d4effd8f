use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Checks a bearer token against the subject the client claims to be.
/// A `false` answer is final; callers do not retry.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn validate(&self, token: &str, subject: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is not `<claims>.<signature>`")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token subject `{token_subject}` does not match `{claimed}`")]
    SubjectMismatch {
        token_subject: String,
        claimed: String,
    },
    #[error("token expired at {expires_at}")]
    Expired { expires_at: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// HMAC-SHA256 signed tokens: `base64url(claims json).base64url(mac)`.
pub struct HmacTokenValidator {
    key: Vec<u8>,
}

impl HmacTokenValidator {
    pub fn new(secret: &str) -> Result<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            anyhow::bail!("identity secret must not be empty");
        }
        Ok(Self {
            key: secret.as_bytes().to_vec(),
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).context("initialize token hmac")
    }

    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String> {
        self.issue_at(subject, now_secs(), ttl)
    }

    pub fn issue_at(&self, subject: &str, issued_at: u64, ttl: Duration) -> Result<String> {
        let claims = TokenClaims {
            sub: subject.to_owned(),
            iat: issued_at,
            exp: issued_at.saturating_add(ttl.as_secs()),
        };
        let encoded = B64.encode(serde_json::to_vec(&claims).context("serialize token claims")?);
        let mut mac = self.mac()?;
        mac.update(encoded.as_bytes());
        let signature = B64.encode(mac.finalize().into_bytes());
        Ok(format!("{encoded}.{signature}"))
    }

    pub fn verify_at(&self, token: &str, subject: &str, now: u64) -> Result<TokenClaims, TokenError> {
        let (encoded, signature) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let signature = B64.decode(signature).map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac().map_err(|_| TokenError::BadSignature)?;
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let raw = B64.decode(encoded).map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims = serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)?;
        if claims.sub != subject {
            return Err(TokenError::SubjectMismatch {
                token_subject: claims.sub,
                claimed: subject.to_owned(),
            });
        }
        if claims.exp <= now {
            return Err(TokenError::Expired {
                expires_at: claims.exp,
            });
        }
        Ok(claims)
    }
}

#[async_trait]
impl IdentityValidator for HmacTokenValidator {
    async fn validate(&self, token: &str, subject: &str) -> bool {
        match self.verify_at(token, subject, now_secs()) {
            Ok(_) => true,
            Err(err) => {
                debug!(subject = %subject, "token rejected: {err}");
                false
            }
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{HmacTokenValidator, IdentityValidator, TokenError};

    #[test]
    fn empty_secret_is_rejected() {
        assert!(HmacTokenValidator::new("  ").is_err());
    }

    #[tokio::test]
    async fn issued_token_validates_for_its_subject_only() {
        let validator = HmacTokenValidator::new("gateway-secret").expect("validator");
        let token = validator
            .issue("alice", Duration::from_secs(60))
            .expect("token");
        assert!(validator.validate(&token, "alice").await);
        assert!(!validator.validate(&token, "mallory").await);
    }

    #[test]
    fn expired_token_is_rejected() {
        let validator = HmacTokenValidator::new("gateway-secret").expect("validator");
        let token = validator
            .issue_at("alice", 1_000, Duration::from_secs(30))
            .expect("token");
        assert!(validator.verify_at(&token, "alice", 1_029).is_ok());
        assert_eq!(
            validator.verify_at(&token, "alice", 1_030),
            Err(TokenError::Expired { expires_at: 1_030 })
        );
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let issuer = HmacTokenValidator::new("other-secret").expect("issuer");
        let validator = HmacTokenValidator::new("gateway-secret").expect("validator");
        let token = issuer
            .issue_at("alice", 1_000, Duration::from_secs(30))
            .expect("token");
        assert_eq!(
            validator.verify_at(&token, "alice", 1_001),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let validator = HmacTokenValidator::new("gateway-secret").expect("validator");
        assert_eq!(
            validator.verify_at("not-a-token", "alice", 0),
            Err(TokenError::Malformed)
        );
        assert_eq!(
            validator.verify_at("abc.!!!", "alice", 0),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn subject_mismatch_reports_both_names() {
        let validator = HmacTokenValidator::new("gateway-secret").expect("validator");
        let token = validator
            .issue_at("alice", 1_000, Duration::from_secs(30))
            .expect("token");
        let err = validator
            .verify_at(&token, "bob", 1_001)
            .expect_err("mismatch");
        assert!(err.to_string().contains("alice"));
        assert!(err.to_string().contains("bob"));
    }
}
