use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, ErrorDetails};

pub const ADMIN_KEY_HEADER: &str = "x-genguard-admin-key";
pub const ADMIN_ID_HEADER: &str = "x-genguard-admin-id";

fn hash_admin_key(key: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"genguard-admin-");
    hasher.update(key.as_bytes());
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

/// Checks the admin credential presented on settings writes and boost grants.
#[derive(Clone)]
pub struct AdminAuthenticator {
    /// Digest of the configured key. `None` when the environment variable was not set.
    key_digest: Option<Vec<u8>>,
    api_key_env: String,
}

impl std::fmt::Debug for AdminAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuthenticator")
            .field("configured", &self.key_digest.is_some())
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

impl AdminAuthenticator {
    pub fn new(key: Option<SecretString>, api_key_env: impl Into<String>) -> Self {
        Self {
            key_digest: key.map(|key| hash_admin_key(key.expose_secret())),
            api_key_env: api_key_env.into(),
        }
    }

    /// Reads the admin key from the environment variable named `api_key_env`.
    pub fn from_env(api_key_env: &str) -> Self {
        let key = std::env::var(api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .map(SecretString::from);
        if key.is_none() {
            tracing::warn!(
                "Admin credential `{api_key_env}` is not set; admin endpoints will return errors"
            );
        }
        Self::new(key, api_key_env)
    }

    pub fn is_configured(&self) -> bool {
        self.key_digest.is_some()
    }

    pub fn authorize(&self, presented: Option<&str>, admin_id: Option<&str>) -> Result<(), Error> {
        let Some(expected) = &self.key_digest else {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "Admin credential is not configured (environment variable `{}` is unset)",
                    self.api_key_env
                ),
            }));
        };
        let presented = presented.map(hash_admin_key).unwrap_or_default();
        if !constant_time_eq(expected, &presented) {
            return Err(Error::new(ErrorDetails::AdminUnauthorized {
                admin_id: admin_id.map(str::to_string),
            }));
        }
        Ok(())
    }
}
