mod key;
mod lockout;
mod revocation;
mod token;

pub use key::SymmetricKey;
pub use lockout::{LockoutState, LockoutTracker};
pub use revocation::RevocationStore;
pub use token::{hash_ciphertext, TokenError, TokenIssuer, TokenPayload};
#[cfg(test)]
pub use revocation::MockRevocationStore;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::LockoutConfig;
use crate::error::{CoreError, Result};
use crate::lifecycle::Lifecycle;

/// The generic "invalid credentials" message returned for every login
/// failure path (unknown user, bad password, locked account). Distinct
/// errors here would tell an attacker which half of the credential pair was
/// wrong, or that an account exists at all.
const INVALID_CREDENTIALS: &str = "invalid username or password";

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>>;
    async fn update_last_login(&self, user_id: i64) -> Result<()>;
}

/// Verifies a plaintext password against a stored hash. Kept as its own
/// trait (rather than a free function) so the hashing scheme is pluggable
/// and so tests can stub out the otherwise-expensive hash comparison.
#[cfg_attr(test, mockall::automock)]
pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Orchestrates login and token validation (§4.11): lockout tracking,
/// credential verification, and token issuance/validation all meet here.
pub struct AuthService {
    users: Arc<dyn UserStore>,
    passwords: Arc<dyn PasswordVerifier>,
    lockout: Arc<LockoutTracker>,
    issuer: TokenIssuer,
    revocation: Arc<dyn RevocationStore>,
    token_ttl: std::time::Duration,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        passwords: Arc<dyn PasswordVerifier>,
        lockout_config: LockoutConfig,
        key: SymmetricKey,
        revocation: Arc<dyn RevocationStore>,
        token_ttl: std::time::Duration,
    ) -> Self {
        Self {
            users,
            passwords,
            lockout: LockoutTracker::new(lockout_config),
            issuer: TokenIssuer::new(key),
            revocation,
            token_ttl,
        }
    }

    pub fn spawn_lockout_cleanup(&self, lifecycle: &Lifecycle, idle_after: std::time::Duration) {
        self.lockout.spawn_cleanup(lifecycle, idle_after);
    }

    pub fn spawn_revocation_cleanup(&self, lifecycle: &Lifecycle) {
        revocation::spawn_cleanup(self.revocation.clone(), lifecycle);
    }

    /// Authenticates a username/password pair and, on success, issues a
    /// token. A locked-out account is rejected before the password is
    /// looked up. An unknown username still runs a dummy verify call
    /// against a fixed hash so that failing on "no such user" takes
    /// roughly as long as failing on "wrong password", narrowing the
    /// timing side-channel an enumeration attack would otherwise have.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        if self.lockout.is_locked(username) {
            warn!(target: "reel_core::auth", username, "login attempt against locked account");
            return Err(CoreError::Auth(INVALID_CREDENTIALS.to_string()));
        }

        let user = self.users.get_by_username(username).await?;

        let (verified, user) = match user {
            Some(user) => {
                let ok = self.passwords.verify(password, &user.password_hash);
                (ok, Some(user))
            }
            None => {
                self.passwords.verify(password, DUMMY_HASH);
                (false, None)
            }
        };

        let Some(user) = user.filter(|_| verified) else {
            self.lockout.record_failure(username);
            return Err(CoreError::Auth(INVALID_CREDENTIALS.to_string()));
        };

        self.lockout.record_success(username);
        if let Err(err) = self.users.update_last_login(user.id).await {
            warn!(target: "reel_core::auth", user_id = user.id, error = %err, "failed to update last login timestamp");
        }

        self.issuer
            .issue(user.id, &user.username, &user.role, self.token_ttl)
    }

    pub async fn validate_token(&self, token: &str) -> Result<TokenPayload> {
        self.issuer
            .validate(token, self.revocation.as_ref())
            .await
            .map_err(|err| CoreError::Auth(err.to_string()))
    }
}

/// A fixed bcrypt-shaped placeholder never matched by any real password; it
/// exists only to give the unknown-username path a verify call to make.
const DUMMY_HASH: &str = "$2b$12$CwTycUXWue0Thq9StjUM0uJ8k7Dz0OZU3XyXb7iL3mJrT1s0s0s0a";
