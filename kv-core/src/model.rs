//! Plain record types for every persistent entity the store manages.
//!
//! These are deliberately dumb structs with no behavior and no reflective
//! persistence -- all reads/writes go through [`crate::repo`]. Deep
//! inheritance / active-record entities are re-expressed here as plain
//! record types plus a repository type with explicit operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// `NULL` and `""` tenants are both treated as "the global namespace";
/// callers normalize the empty string to `None` before it reaches the repo.
pub type Tenant = Option<String>;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KvBucket {
    pub id: Uuid,
    pub tenant: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub max_value_size: i64,
    pub max_history_per_key: i64,
    pub ttl_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

impl KvOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvOperation::Put => "PUT",
            KvOperation::Delete => "DELETE",
            KvOperation::Purge => "PURGE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KvEntry {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub tenant: Option<String>,
    pub key: String,
    #[serde(with = "serde_bytes_opt")]
    pub value: Option<Vec<u8>>,
    pub revision: i64,
    pub operation: KvOperation,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    pub fn is_tombstone(&self) -> bool {
        matches!(self.operation, KvOperation::Delete)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ObjectBucket {
    pub id: Uuid,
    pub tenant: Option<String>,
    pub name: String,
    pub chunk_size: i64,
    pub max_object_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_CHUNK_SIZE: i64 = 1024 * 1024;
pub const DEFAULT_MAX_OBJECT_SIZE: i64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum ObjectStatus {
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ObjectMetadata {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub tenant: Option<String>,
    pub name: String,
    pub size: i64,
    pub chunk_count: i32,
    pub digest: String,
    pub digest_algorithm: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
    #[sqlx(json)]
    pub headers: serde_json::Value,
    pub status: ObjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MetadataChunkLink {
    pub id: Uuid,
    pub metadata_id: Uuid,
    pub chunk_index: i32,
    pub chunk_digest: String,
}

/// Event shape dispatched to watchers, matching the WebSocket watch frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvWatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub revision: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectWatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub bucket: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// `serde_bytes`-style (de)serialization for `Option<Vec<u8>>` without
/// pulling in the `serde_bytes` crate for one field.
mod serde_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                bytes,
            )),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        opt.map(|s| {
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
