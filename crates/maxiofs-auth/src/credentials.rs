//! Secret-key resolution.

use std::collections::HashMap;

use crate::error::AuthError;

/// Resolves the secret key belonging to an access key id.
///
/// The server backs this with the metadata store; tests use
/// [`InMemoryCredentials`]. Lookups are read-mostly, so implementations may
/// cache as long as they invalidate on key revocation.
pub trait CredentialStore: Send + Sync {
    /// Return the secret key for `access_key_id`.
    ///
    /// # Errors
    ///
    /// [`AuthError::UnknownAccessKey`] when the id is not registered.
    fn secret_for(&self, access_key_id: &str) -> Result<String, AuthError>;
}

/// Fixed credential set for tests and single-user deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentials {
    keys: HashMap<String, String>,
}

impl InMemoryCredentials {
    /// Build from `(access_key_id, secret_key)` pairs.
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            keys: pairs.into_iter().collect(),
        }
    }
}

impl CredentialStore for InMemoryCredentials {
    fn secret_for(&self, access_key_id: &str) -> Result<String, AuthError> {
        self.keys
            .get(access_key_id)
            .cloned()
            .ok_or_else(|| AuthError::UnknownAccessKey(access_key_id.to_owned()))
    }
}
