//! Types of the HTTP API.
//!
//! Consumed by the dashboard and by the approval pages; everything is JSON
//! with camel-cased member names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub bunker_uris: Vec<String>,
    pub relays: Vec<Url>,
    pub admin_pubkey: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RequestsList {
    pub requests: Vec<RequestEntry>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestEntry {
    pub id: i64,
    pub request_id: String,
    pub key_name: String,
    pub remote_pubkey: String,
    pub method: String,
    pub params: Value,
    pub allowed: Option<bool>,
    pub created_at: i64,
    /// Seconds until the reaper removes an undecided request.
    pub ttl_seconds: i64,
    /// For `sign_event` requests whose event parses, the interesting bits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_preview: Option<EventPreview>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EventPreview {
    pub kind: Option<i64>,
    pub content: Option<String>,
    pub tags: Option<Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ApproveBody {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ApproveResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApproveResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RegisterBody {
    pub username: String,
    pub domain: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KeysList {
    pub keys: Vec<KeyEntry>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    pub name: String,
    /// The npub, known once the key has been unlocked at least this boot.
    pub npub: Option<String>,
    /// Whether the key is currently unlocked.
    pub active: bool,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bunker_uri: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct KeyCreate {
    pub key_name: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub nsec: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KeyCreateResult {
    pub name: String,
    pub npub: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum KeyCreateError {
    InvalidName,
    AlreadyExists,
    BadSecret,
    Internal,
}

impl std::fmt::Display for KeyCreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::InvalidName => "a key name is required",
            Self::AlreadyExists => "a key of this name already exists",
            Self::BadSecret => "the secret is not a valid key",
            Self::Internal => "an internal error occurred",
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AppsList {
    pub apps: Vec<AppEntry>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AppEntry {
    pub id: i64,
    pub key_name: String,
    pub description: Option<String>,
    pub pubkey: String,
    /// Derived permission strings, e.g. `sign_event:1` or `connect`.
    pub permissions: Vec<String>,
    pub request_count: i64,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RenameBody {
    pub description: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Dashboard {
    pub counts: DashboardCounts,
    pub recent: Vec<AuditEntryInfo>,
    pub activity: Vec<ActivityBucket>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DashboardCounts {
    pub keys: i64,
    pub apps: i64,
    pub pending_requests: i64,
    pub policies: i64,
    pub tokens: i64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntryInfo {
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub method: Option<String>,
    pub key_user_id: Option<i64>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ActivityBucket {
    pub hour: i64,
    pub count: i64,
}
