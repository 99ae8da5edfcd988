use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

/// Placeholder used by request extraction when no client address could be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Who is asking. `user_id` is canonical when present; anonymous traffic is approximated by IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub user_id: Option<String>,
    pub ip_address: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Key under which every counter, cooldown and ban for an identity is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Identity {
    pub fn new(
        user_id: Option<String>,
        ip_address: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            user_id: non_blank(user_id),
            ip_address: ip_address.into().trim().to_string(),
            session_id: non_blank(session_id),
        }
    }

    pub fn user(user_id: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self::new(Some(user_id.into()), ip_address, None)
    }

    pub fn anonymous(ip_address: impl Into<String>, session_id: Option<String>) -> Self {
        Self::new(None, ip_address, session_id)
    }

    fn has_ip(&self) -> bool {
        !self.ip_address.is_empty() && self.ip_address != UNKNOWN_IP
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|u| !u.trim().is_empty())
    }

    pub fn canonical_key(&self) -> Result<IdentityKey, Error> {
        if let Some(user_id) = self.user_id() {
            return Ok(IdentityKey(format!("user:{}", user_id.trim())));
        }
        if self.has_ip() {
            return Ok(IdentityKey(format!("ip:{}", self.ip_address.trim())));
        }
        Err(Error::new(ErrorDetails::MissingIdentity))
    }
}
