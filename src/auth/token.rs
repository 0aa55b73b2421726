use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::auth::key::SymmetricKey;
use crate::auth::revocation::RevocationStore;

const NONCE_LEN: usize = 12;

/// The claims carried inside an issued token, encrypted at rest so the
/// opaque string handed to a client reveals nothing on inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenPayload {
    pub user_id: i64,
    pub username: String,
    pub role: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A token failed validation. The two cases are kept distinct because a
/// revoked token is a caller we actively want to reject (e.g. the session
/// was logged out elsewhere), whereas `Invalid` covers everything else
/// (malformed, undecryptable, expired) without leaking which.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is invalid or expired")]
    Invalid,
    #[error("token has been revoked")]
    Revoked,
}

/// Issues and validates AES-256-GCM encrypted bearer tokens (§4.11).
pub struct TokenIssuer {
    key: SymmetricKey,
}

impl TokenIssuer {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    pub fn issue(
        &self,
        user_id: i64,
        username: &str,
        role: &str,
        ttl: std::time::Duration,
    ) -> crate::error::Result<String> {
        let now = Utc::now();
        let payload = TokenPayload {
            user_id,
            username: username.to_string(),
            role: role.to_string(),
            issued_at: now,
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero()),
        };

        let plaintext = serde_json::to_vec(&payload).map_err(crate::error::CoreError::Serialization)?;

        let cipher = Aes256Gcm::new_from_slice(self.key.as_bytes()).map_err(|e| {
            crate::error::CoreError::Fatal(format!("invalid auth key: {e}"))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher.encrypt(&nonce, plaintext.as_ref()).map_err(|e| {
            crate::error::CoreError::Auth(format!("failed to encrypt token: {e}"))
        })?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(framed))
    }

    /// Validates a token's encryption, expiry, and revocation status.
    /// Revocation is checked against the ciphertext hash before decryption,
    /// so a revoked token is rejected even if it would otherwise decrypt.
    pub async fn validate(
        &self,
        token: &str,
        revocation: &dyn RevocationStore,
    ) -> Result<TokenPayload, TokenError> {
        let framed = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TokenError::Invalid)?;

        if framed.len() <= NONCE_LEN {
            return Err(TokenError::Invalid);
        }

        let ciphertext_hash = hash_ciphertext(token);
        match revocation.is_revoked(&ciphertext_hash).await {
            Ok(true) => return Err(TokenError::Revoked),
            Ok(false) => {}
            Err(_) => return Err(TokenError::Invalid),
        }

        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let cipher =
            Aes256Gcm::new_from_slice(self.key.as_bytes()).map_err(|_| TokenError::Invalid)?;
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| TokenError::Invalid)?;

        let payload: TokenPayload =
            serde_json::from_slice(&plaintext).map_err(|_| TokenError::Invalid)?;

        if payload.expires_at <= Utc::now() {
            return Err(TokenError::Invalid);
        }

        Ok(payload)
    }
}

/// Hashes the opaque token string (not the decrypted payload) so revocation
/// lookups never need the key and can be done by anything holding the raw
/// token, such as a logout endpoint.
pub fn hash_ciphertext(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::revocation::MockRevocationStore;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(SymmetricKey::accept(&"k".repeat(32)).unwrap())
    }

    #[tokio::test]
    async fn issue_then_validate_round_trips_the_payload() {
        let issuer = issuer();
        let token = issuer
            .issue(1, "alice", "admin", std::time::Duration::from_secs(3600))
            .unwrap();

        let mut revocation = MockRevocationStore::new();
        revocation.expect_is_revoked().returning(|_| Ok(false));

        let payload = issuer.validate(&token, &revocation).await.unwrap();
        assert_eq!(payload.username, "alice");
        assert_eq!(payload.role, "admin");
    }

    #[tokio::test]
    async fn expired_token_is_invalid() {
        let issuer = issuer();
        let token = issuer
            .issue(1, "alice", "admin", std::time::Duration::from_secs(0))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut revocation = MockRevocationStore::new();
        revocation.expect_is_revoked().returning(|_| Ok(false));

        let err = issuer.validate(&token, &revocation).await.unwrap_err();
        assert_eq!(err, TokenError::Invalid);
    }

    #[tokio::test]
    async fn revoked_token_reports_revoked_distinctly() {
        let issuer = issuer();
        let token = issuer
            .issue(1, "alice", "admin", std::time::Duration::from_secs(3600))
            .unwrap();

        let mut revocation = MockRevocationStore::new();
        revocation.expect_is_revoked().returning(|_| Ok(true));

        let err = issuer.validate(&token, &revocation).await.unwrap_err();
        assert_eq!(err, TokenError::Revoked);
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let issuer = issuer();
        let mut revocation = MockRevocationStore::new();
        revocation.expect_is_revoked().returning(|_| Ok(false));

        let err = issuer.validate("not a real token", &revocation).await.unwrap_err();
        assert_eq!(err, TokenError::Invalid);
    }
}
