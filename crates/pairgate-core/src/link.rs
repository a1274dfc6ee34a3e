//! Domain types for link attempts and persisted sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How the device is being linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Pair,
    Qr,
}

impl LinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pair => "pair",
            Self::Qr => "qr",
        }
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LinkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pair" => Ok(Self::Pair),
            "qr" => Ok(Self::Qr),
            other => Err(format!("unknown link mode: {other}")),
        }
    }
}

/// Lifecycle status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Coarse tag for a captured credential file. Metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Creds,
    Auth,
    Config,
    Other,
}

impl FileKind {
    /// Classify a file by name.
    pub fn classify(name: &str) -> Self {
        if name == CREDS_FILE {
            Self::Creds
        } else if name.contains("auth") {
            Self::Auth
        } else if name.contains("config") {
            Self::Config
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creds => "creds",
            Self::Auth => "auth",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Name of the primary credentials file written by the messaging library.
pub const CREDS_FILE: &str = "creds.json";

/// One linking attempt as received by the HTTP facade.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    /// Canonical phone digits. `None` for QR mode until the scan reveals it.
    pub key: Option<String>,
    pub mode: LinkMode,
    pub created_at: DateTime<Utc>,
}

impl LinkRequest {
    pub fn pair(key: String) -> Self {
        Self {
            key: Some(key),
            mode: LinkMode::Pair,
            created_at: Utc::now(),
        }
    }

    pub fn qr() -> Self {
        Self {
            key: None,
            mode: LinkMode::Qr,
            created_at: Utc::now(),
        }
    }

    /// Name of the local credential store directory for this attempt.
    ///
    /// Pair attempts reuse the phone number so a retry for the same number
    /// lands on (and clears) the same directory. QR attempts get a fresh id.
    pub fn store_name(&self) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => format!("qr_{}", Uuid::new_v4().simple()),
        }
    }

    /// Session id reported back to the linked account.
    pub fn session_id(&self, key: &str) -> String {
        format!("{}_{key}_{}", self.mode, self.created_at.timestamp_millis())
    }
}

/// A captured credential file in the manifest of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFile {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
}

/// The durable representation of a completed link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub key: String,
    pub session_id: String,
    pub mode: LinkMode,
    pub credentials: serde_json::Value,
    pub files: Vec<SessionFile>,
    pub status: SessionStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// An append-only history row: the credential set captured by one link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionVersion {
    pub key: String,
    pub version: i64,
    pub session_id: String,
    pub mode: LinkMode,
    pub files: Vec<SessionFile>,
    pub created_at: DateTime<Utc>,
}

/// Group a pairing code into 4-character blocks joined by `-`.
pub fn format_pairing_code(code: &str) -> String {
    let chars: Vec<char> = code.trim().chars().collect();
    chars
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Extract the phone digits from a device JID like `15551234567:1@s.whatsapp.net`.
pub fn jid_user(jid: &str) -> Option<String> {
    let user = jid.split('@').next()?.split(':').next()?;
    if user.is_empty() || !user.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(user.to_string())
}

/// Personal chat JID for a phone key.
pub fn user_jid(key: &str) -> String {
    format!("{key}@s.whatsapp.net")
}
