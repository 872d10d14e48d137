//! Console login verification.
//!
//! The storage plane treats credential hashing as pluggable: the
//! [`IdentityStore`] trait is the seam, and [`MetaIdentityStore`] is the
//! built-in implementation over MetaStore user rows. It also owns the
//! lockout bookkeeping (`failed_attempts`, `locked_until`) driven by the
//! dynamic settings.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use maxiofs_core::types::User;
use maxiofs_core::{DynamicSettings, Error, Result, ids};
use maxiofs_meta::{MetaStore, keys};
use uuid::Uuid;

/// Verifies console credentials and maintains lockout state.
pub trait IdentityStore: Send + Sync {
    /// Authenticate `username`/`password` under the given lockout policy.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] for unknown users, wrong passwords, and
    /// locked accounts; implementations must not reveal which.
    fn authenticate(&self, username: &str, password: &str, policy: &DynamicSettings)
    -> Result<User>;

    /// Clear a user's lockout state.
    fn unlock(&self, user_id: Uuid) -> Result<()>;
}

/// Hash a password the way [`MetaIdentityStore`] expects it stored.
#[must_use]
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// The built-in identity store over MetaStore user rows.
#[derive(Debug)]
pub struct MetaIdentityStore {
    meta: Arc<MetaStore>,
}

impl MetaIdentityStore {
    /// Build over `meta`.
    #[must_use]
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    fn load_by_username(&self, username: &str) -> Result<Option<User>> {
        let Some(user_id) = self.meta.get::<Uuid>(&keys::username(username))? else {
            return Ok(None);
        };
        self.meta.get(&keys::user(user_id))
    }
}

impl IdentityStore for MetaIdentityStore {
    fn authenticate(
        &self,
        username: &str,
        password: &str,
        policy: &DynamicSettings,
    ) -> Result<User> {
        let now = ids::now_secs();
        let Some(user) = self.load_by_username(username)? else {
            debug!(username, "login for unknown user");
            return Err(Error::Unauthorized);
        };

        if user.is_locked(now) {
            warn!(username, "login attempt against locked account");
            return Err(Error::Unauthorized);
        }

        let presented = hash_password(password);
        // Constant-time equality over the hex digests.
        let matches = presented.len() == user.password_hash.len()
            && presented
                .bytes()
                .zip(user.password_hash.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;

        let user_key = keys::user(user.id);
        if matches {
            if user.failed_attempts > 0 {
                self.meta.update(|txn| {
                    if let Some(mut stored) = txn.get::<User>(&user_key)? {
                        stored.failed_attempts = 0;
                        stored.locked_until = None;
                        txn.put(&user_key, &stored)?;
                    }
                    Ok(())
                })?;
            }
            return Ok(user);
        }

        // Record the failure and lock out past the threshold.
        self.meta.update(|txn| {
            if let Some(mut stored) = txn.get::<User>(&user_key)? {
                stored.failed_attempts += 1;
                if stored.failed_attempts >= policy.max_failed_attempts {
                    stored.locked_until =
                        Some(now + i64::try_from(policy.lockout_duration_s).unwrap_or(0));
                    warn!(username, attempts = stored.failed_attempts, "account locked");
                }
                stored.updated_at = now;
                txn.put(&user_key, &stored)?;
            }
            Ok(())
        })?;
        Err(Error::Unauthorized)
    }

    fn unlock(&self, user_id: Uuid) -> Result<()> {
        let user_key = keys::user(user_id);
        self.meta.update(|txn| {
            let mut user: User = txn.get(&user_key)?.ok_or(Error::Unauthorized)?;
            user.failed_attempts = 0;
            user.locked_until = None;
            user.updated_at = ids::now_secs();
            txn.put(&user_key, &user)
        })
    }
}
