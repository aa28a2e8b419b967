//! Hand-written SQL for KV buckets and entries.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::CResult;
use crate::model::{KvBucket, KvEntry, KvOperation};

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
    let bucket = sqlx::query_as::<_, KvBucket>(
        r#"
        INSERT INTO kv_buckets (tenant, name, description, max_value_size, max_history_per_key, ttl_seconds)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(tenant)
    .bind(name)
    .bind(description)
    .bind(max_value_size)
    .bind(max_history_per_key)
    .bind(ttl_seconds)
    .fetch_one(&mut **tx)
    .await?;
    Ok(bucket)
}

/// Updates the mutable limits on an existing bucket (`PUT
/// /…/buckets/{name}`). Name, tenant and id are immutable once created.
#[allow(clippy::too_many_arguments)]
pub async fn update_bucket_limits(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    description: Option<&str>,
    max_value_size: i64,
    max_history_per_key: i64,
    ttl_seconds: Option<i64>,
) -> CResult<KvBucket> {
    let bucket = sqlx::query_as::<_, KvBucket>(
        r#"
        UPDATE kv_buckets
        SET description = $2, max_value_size = $3, max_history_per_key = $4,
            ttl_seconds = $5, updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(bucket_id)
    .bind(description)
    .bind(max_value_size)
    .bind(max_history_per_key)
    .bind(ttl_seconds)
    .fetch_one(&mut **tx)
    .await?;
    Ok(bucket)
}

pub async fn get_bucket_by_name(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
) -> CResult<KvBucket> {
    let bucket = sqlx::query_as::<_, KvBucket>(
        "SELECT * FROM kv_buckets WHERE name = $1",
    )
    .bind(name)
    .fetch_one(&mut **tx)
    .await?;
    Ok(bucket)
}

pub async fn list_buckets(tx: &mut Transaction<'_, Postgres>) -> CResult<Vec<KvBucket>> {
    let buckets = sqlx::query_as::<_, KvBucket>("SELECT * FROM kv_buckets ORDER BY name")
        .fetch_all(&mut **tx)
        .await?;
    Ok(buckets)
}

pub async fn delete_bucket(tx: &mut Transaction<'_, Postgres>, name: &str) -> CResult<()> {
    let result = sqlx::query("DELETE FROM kv_buckets WHERE name = $1")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(crate::error::Error::NotFound);
    }
    Ok(())
}

/// Appends a new revisioned entry. `revision` must already have been
/// allocated by [`crate::revision::allocate_next`] in the same transaction.
#[allow(clippy::too_many_arguments)]
pub async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    tenant: Option<&str>,
    key: &str,
    value: Option<&[u8]>,
    revision: i64,
    operation: KvOperation,
    expires_at: Option<DateTime<Utc>>,
) -> CResult<KvEntry> {
    let entry = sqlx::query_as::<_, KvEntry>(
        r#"
        INSERT INTO kv_entries (bucket_id, tenant, key, value, revision, operation, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(bucket_id)
    .bind(tenant)
    .bind(key)
    .bind(value)
    .bind(revision)
    .bind(operation)
    .bind(expires_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(entry)
}

/// The latest entry for `key`, whatever its operation -- callers decide
/// whether a tombstone or expired row means "not found".
pub async fn get_latest(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: &str,
) -> CResult<Option<KvEntry>> {
    let entry = sqlx::query_as::<_, KvEntry>(
        r#"
        SELECT * FROM kv_entries
        WHERE bucket_id = $1 AND key = $2
        ORDER BY revision DESC
        LIMIT 1
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(entry)
}

pub async fn get_at_revision(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: &str,
    revision: i64,
) -> CResult<Option<KvEntry>> {
    let entry = sqlx::query_as::<_, KvEntry>(
        "SELECT * FROM kv_entries WHERE bucket_id = $1 AND key = $2 AND revision = $3",
    )
    .bind(bucket_id)
    .bind(key)
    .bind(revision)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(entry)
}

/// Full revision history for `key`, newest first, capped at `limit`.
pub async fn list_history(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: &str,
    limit: i64,
) -> CResult<Vec<KvEntry>> {
    let entries = sqlx::query_as::<_, KvEntry>(
        r#"
        SELECT * FROM kv_entries
        WHERE bucket_id = $1 AND key = $2
        ORDER BY revision DESC
        LIMIT $3
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;
    Ok(entries)
}

/// Trims history beyond `keep` newest revisions for `key`, called after
/// every Put/Delete so a bucket's `max_history_per_key` is enforced
/// incrementally rather than by a separate sweep.
pub async fn trim_history(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: &str,
    keep: i64,
) -> CResult<()> {
    sqlx::query(
        r#"
        DELETE FROM kv_entries
        WHERE id IN (
            SELECT id FROM kv_entries
            WHERE bucket_id = $1 AND key = $2
            ORDER BY revision DESC
            OFFSET $3
        )
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .bind(keep)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Deletes every revision of `key`, used by the hard Purge operation
/// rather than the soft tombstone Delete leaves behind.
pub async fn purge_key(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: &str,
) -> CResult<u64> {
    let result = sqlx::query("DELETE FROM kv_entries WHERE bucket_id = $1 AND key = $2")
        .bind(bucket_id)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

/// Latest non-tombstone entry per key in the bucket, for listing. Keys
/// whose latest entry is a tombstone are excluded; expiry is filtered by
/// the caller since "now" isn't a SQL concern here.
pub async fn list_latest_entries(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    prefix: Option<&str>,
    limit: i64,
    offset: i64,
) -> CResult<Vec<KvEntry>> {
    let pattern = prefix.map(|p| format!("{}%", p.replace('%', "\\%").replace('_', "\\_")));
    let entries = sqlx::query_as::<_, KvEntry>(
        r#"
        SELECT DISTINCT ON (key) *
        FROM kv_entries
        WHERE bucket_id = $1 AND ($2::text IS NULL OR key LIKE $2)
        ORDER BY key, revision DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(bucket_id)
    .bind(pattern)
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut **tx)
    .await?;
    Ok(entries)
}

/// Keys whose latest entry has an `expires_at` in the past and is not
/// already a tombstone -- the Expiry Sweeper's unit of work.
pub async fn list_expired_keys(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    now: DateTime<Utc>,
    batch_size: i64,
) -> CResult<Vec<String>> {
    let keys: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT key FROM (
            SELECT DISTINCT ON (key) key, operation, expires_at
            FROM kv_entries
            WHERE bucket_id = $1
            ORDER BY key, revision DESC
        ) latest
        WHERE operation != 'DELETE' AND expires_at IS NOT NULL AND expires_at <= $2
        LIMIT $3
        "#,
    )
    .bind(bucket_id)
    .bind(now)
    .bind(batch_size)
    .fetch_all(&mut **tx)
    .await?;
    Ok(keys)
}

/// Every entry committed after `since`, in commit order, for the Watch
/// replay path. `key` narrows to a single key's
/// history for a key-scope watcher; `None` replays across the whole
/// bucket for a bucket-scope watcher.
pub async fn list_entries_since(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: Option<&str>,
    since_revision: i64,
) -> CResult<Vec<KvEntry>> {
    let entries = sqlx::query_as::<_, KvEntry>(
        r#"
        SELECT * FROM kv_entries
        WHERE bucket_id = $1 AND ($2::text IS NULL OR key = $2) AND revision > $3
        ORDER BY created_at ASC
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .bind(since_revision)
    .fetch_all(&mut **tx)
    .await?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        let prefix = "50%_off";
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        assert_eq!(pattern, "50\\%\\_off%");
    }
}
