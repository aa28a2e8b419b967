//! KV Engine: put, get, delete, purge, history, and CAS.
//!
//! Every public function here opens nothing itself -- callers drive a
//! [`crate::tenant::TenantSession`] and pass its transaction through, so a
//! caller can compose several engine calls (e.g. a batch put) inside one
//! commit, taking `&mut self` over a single storage handle, generalized
//! to a borrowed transaction.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::{CResult, Error};
use crate::model::{KvBucket, KvEntry, KvOperation};
use crate::repo::kv_repo;
use crate::revision;

const MAX_KEY_LEN: usize = 2048;

fn validate_key(key: &str) -> CResult<()> {
    if key.is_empty() {
        return Err(Error::Validation("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "key exceeds maximum length of {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

fn validate_put(bucket: &KvBucket, key: &str, value: &[u8]) -> CResult<()> {
    validate_key(key)?;
    if value.len() as i64 > bucket.max_value_size {
        return Err(Error::Validation(format!(
            "value of {} bytes exceeds bucket max_value_size of {}",
            value.len(),
            bucket.max_value_size
        )));
    }
    Ok(())
}

fn expiry_for(bucket: &KvBucket, now: DateTime<Utc>, ttl_override: Option<i64>) -> CResult<Option<DateTime<Utc>>> {
    let ttl = match ttl_override {
        Some(ttl) => Some(ttl),
        None => bucket.ttl_seconds,
    };
    match ttl {
        Some(seconds) if seconds > 0 => Ok(Some(now + Duration::seconds(seconds))),
        Some(_) => Ok(None),
        None => Ok(None),
    }
}

/// Writes a new revision for `key`, unconditionally. Returns the entry as
/// persisted, with its freshly allocated revision.
pub async fn put(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &KvBucket,
    key: &str,
    value: &[u8],
    ttl_override: Option<i64>,
    now: DateTime<Utc>,
) -> CResult<KvEntry> {
    validate_put(bucket, key, value)?;
    let expires_at = expiry_for(bucket, now, ttl_override)?;
    let rev = revision::allocate_next(tx, bucket.id, key).await?;
    let entry = kv_repo::insert_entry(
        tx,
        bucket.id,
        bucket.tenant.as_deref(),
        key,
        Some(value),
        rev,
        KvOperation::Put,
        expires_at,
    )
    .await?;
    if bucket.max_history_per_key > 0 {
        kv_repo::trim_history(tx, bucket.id, key, bucket.max_history_per_key).await?;
    }
    Ok(entry)
}

/// Compare-and-swap: succeeds only if the key's current revision equals
/// `expected_revision` (0 meaning "key must not exist yet"). `peek_current`
/// takes the sequencer row lock first, so the `get_latest` re-read that
/// follows it is serialized against every other writer or CAS on the same
/// key -- the lock, not the read, is what makes this atomic.
pub async fn compare_and_swap(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &KvBucket,
    key: &str,
    expected_revision: i64,
    value: &[u8],
    ttl_override: Option<i64>,
    now: DateTime<Utc>,
) -> CResult<KvEntry> {
    validate_put(bucket, key, value)?;
    revision::peek_current(tx, bucket.id, key).await?;
    let current = kv_repo::get_latest(tx, bucket.id, key).await?;
    let current_revision = match &current {
        Some(entry) if !entry.is_tombstone() => entry.revision,
        _ => 0,
    };
    if current_revision != expected_revision {
        return Err(Error::CasConflict);
    }
    let expires_at = expiry_for(bucket, now, ttl_override)?;
    let rev = revision::allocate_next(tx, bucket.id, key).await?;
    let entry = kv_repo::insert_entry(
        tx,
        bucket.id,
        bucket.tenant.as_deref(),
        key,
        Some(value),
        rev,
        KvOperation::Put,
        expires_at,
    )
    .await?;
    if bucket.max_history_per_key > 0 {
        kv_repo::trim_history(tx, bucket.id, key, bucket.max_history_per_key).await?;
    }
    Ok(entry)
}

/// Reads the latest live value. Tombstoned or expired entries are
/// reported as `NotFound` -- history and debugging flows use [`history`]
/// to see past revisions.
pub async fn get(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &KvBucket,
    key: &str,
    now: DateTime<Utc>,
) -> CResult<KvEntry> {
    validate_key(key)?;
    let entry = kv_repo::get_latest(tx, bucket.id, key).await?.ok_or(Error::NotFound)?;
    if entry.is_tombstone() || entry.is_expired(now) {
        return Err(Error::NotFound);
    }
    Ok(entry)
}

/// Writes a tombstone revision. Unlike [`purge`], the key's history is
/// preserved (subject to `max_history_per_key`) and a subsequent Put can
/// still see the tombstone's revision as its CAS baseline.
pub async fn delete(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &KvBucket,
    key: &str,
    _now: DateTime<Utc>,
) -> CResult<KvEntry> {
    validate_key(key)?;
    let existing = kv_repo::get_latest(tx, bucket.id, key).await?;
    match existing {
        Some(entry) if !entry.is_tombstone() => {}
        _ => return Err(Error::NotFound),
    }
    let rev = revision::allocate_next(tx, bucket.id, key).await?;
    let entry = kv_repo::insert_entry(
        tx,
        bucket.id,
        bucket.tenant.as_deref(),
        key,
        None,
        rev,
        KvOperation::Delete,
        None,
    )
    .await?;
    if bucket.max_history_per_key > 0 {
        kv_repo::trim_history(tx, bucket.id, key, bucket.max_history_per_key).await?;
    }
    Ok(entry)
}

/// Removes every revision of `key`, irreversibly. Used for hard deletes
/// (GDPR-style erasure) where the tombstone-preserving `delete` isn't
/// sufficient.
pub async fn purge(tx: &mut Transaction<'_, Postgres>, bucket: &KvBucket, key: &str) -> CResult<()> {
    validate_key(key)?;
    let removed = kv_repo::purge_key(tx, bucket.id, key).await?;
    if removed == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub async fn history(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &KvBucket,
    key: &str,
    limit: i64,
) -> CResult<Vec<KvEntry>> {
    validate_key(key)?;
    kv_repo::list_history(tx, bucket.id, key, limit).await
}

pub async fn list_keys(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &KvBucket,
    prefix: Option<&str>,
    limit: i64,
    offset: i64,
    now: DateTime<Utc>,
) -> CResult<Vec<KvEntry>> {
    let entries = kv_repo::list_latest_entries(tx, bucket.id, prefix, limit, offset).await?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_tombstone() && !e.is_expired(now))
        .collect())
}

#[allow(clippy::too_many_arguments)]
pub async fn create_bucket(
    tx: &mut Transaction<'_, Postgres>,
    tenant: Option<&str>,
    name: &str,
    description: Option<&str>,
    max_value_size: i64,
    max_history_per_key: i64,
    ttl_seconds: Option<i64>,
) -> CResult<KvBucket> {
    if name.is_empty() {
        return Err(Error::Validation("bucket name must not be empty".into()));
    }
    kv_repo::create_bucket(
        tx,
        tenant,
        name,
        description,
        max_value_size,
        max_history_per_key,
        ttl_seconds,
    )
    .await
}

pub async fn get_bucket(tx: &mut Transaction<'_, Postgres>, name: &str) -> CResult<KvBucket> {
    kv_repo::get_bucket_by_name(tx, name).await
}

pub async fn list_buckets(tx: &mut Transaction<'_, Postgres>) -> CResult<Vec<KvBucket>> {
    kv_repo::list_buckets(tx).await
}

pub async fn delete_bucket(tx: &mut Transaction<'_, Postgres>, name: &str) -> CResult<()> {
    kv_repo::delete_bucket(tx, name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_rejects_empty_and_overlong() {
        assert!(validate_key("").is_err());
        assert!(validate_key(&"x".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(validate_key("ok").is_ok());
    }

    fn sample_bucket() -> KvBucket {
        KvBucket {
            id: Uuid::nil(),
            tenant: None,
            name: "default".into(),
            description: None,
            max_value_size: 16,
            max_history_per_key: 10,
            ttl_seconds: Some(60),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_put_enforces_bucket_value_size() {
        let bucket = sample_bucket();
        assert!(validate_put(&bucket, "k", b"short").is_ok());
        assert!(validate_put(&bucket, "k", b"this value is far too long").is_err());
    }

    #[test]
    fn expiry_override_takes_precedence_over_bucket_default() {
        let bucket = sample_bucket();
        let now = Utc::now();
        let default_expiry = expiry_for(&bucket, now, None).unwrap().unwrap();
        assert_eq!(default_expiry, now + Duration::seconds(60));

        let overridden = expiry_for(&bucket, now, Some(120)).unwrap().unwrap();
        assert_eq!(overridden, now + Duration::seconds(120));

        let disabled = expiry_for(&bucket, now, Some(0)).unwrap();
        assert_eq!(disabled, None);
    }
}
