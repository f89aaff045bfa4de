//! Stored record shapes: credentials, users, usage trail

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The two independent credential classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyKind {
    /// Image-search provider key
    Search,
    /// HTTP egress (scraping proxy) key
    Proxy,
}

impl KeyKind {
    pub const ALL: [KeyKind; 2] = [KeyKind::Search, KeyKind::Proxy];

    /// Label for logs, metrics and lock scopes.
    pub fn label(&self) -> &'static str {
        match self {
            KeyKind::Search => "SEARCH",
            KeyKind::Proxy => "PROXY",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SEARCH" => Ok(KeyKind::Search),
            "PROXY" => Ok(KeyKind::Proxy),
            other => Err(format!("unknown key kind `{other}`, expected SEARCH or PROXY")),
        }
    }
}

/// One pooled credential.
///
/// `quota_remaining` means "provider-reported remaining calls" for SEARCH keys
/// and "allowance of the current tier" for PROXY keys. `revision` is bumped by
/// the store on every successful update and is what conditional updates compare.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub kind: KeyKind,
    pub secret: String,
    pub quota_remaining: u32,
    pub is_active: bool,
    pub is_fresh_allowance: bool,
    #[serde(default)]
    pub first_leased_at: Option<DateTime<Utc>>,
    /// Eligible again once this instant passes (timed suspension).
    #[serde(default)]
    pub suspended_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("secret", &"[REDACTED]")
            .field("quota_remaining", &self.quota_remaining)
            .field("is_active", &self.is_active)
            .field("is_fresh_allowance", &self.is_fresh_allowance)
            .field("first_leased_at", &self.first_leased_at)
            .field("suspended_until", &self.suspended_until)
            .field("created_at", &self.created_at)
            .field("revision", &self.revision)
            .finish()
    }
}

impl ApiKey {
    /// New active key with a fresh id and the given starting quota.
    pub fn new(kind: KeyKind, secret: String, quota_remaining: u32, is_fresh_allowance: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            secret,
            quota_remaining,
            is_active: true,
            is_fresh_allowance,
            first_leased_at: None,
            suspended_until: None,
            created_at: Utc::now(),
            revision: 0,
        }
    }

    /// Whether a timed suspension has run out at `now`.
    pub fn suspension_elapsed(&self, now: DateTime<Utc>) -> bool {
        !self.is_active && self.suspended_until.is_some_and(|until| until <= now)
    }

    /// Stable, non-reversible identifier of the secret (12 chars of SHA-256).
    ///
    /// Lets admins recognise a key and detect duplicates without ever
    /// returning the secret itself.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.secret)
    }
}

/// Fingerprint of a raw secret, see [`ApiKey::fingerprint`].
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(12);
    encoded
}

/// Service level of an end user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    /// Subject to the daily search limit
    #[default]
    Ordinary,
    Premium,
    Admin,
}

impl UserStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UserStatus::Ordinary => "ORDINARY",
            UserStatus::Premium => "PREMIUM",
            UserStatus::Admin => "ADMIN",
        }
    }

    /// Whether the daily search limit applies.
    pub fn is_capped(&self) -> bool {
        *self == UserStatus::Ordinary
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ORDINARY" => Ok(UserStatus::Ordinary),
            "PREMIUM" => Ok(UserStatus::Premium),
            "ADMIN" => Ok(UserStatus::Admin),
            other => Err(format!(
                "unknown user status `{other}`, expected ORDINARY, PREMIUM or ADMIN"
            )),
        }
    }
}

/// An end user, created the first time they search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            status: UserStatus::Ordinary,
            created_at,
        }
    }
}

/// Audit entry for one key used on behalf of one user. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub key_id: String,
    pub kind: KeyKind,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(user_id: &str, key_id: &str, kind: KeyKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            key_id: key_id.to_string(),
            kind,
            timestamp,
        }
    }
}
