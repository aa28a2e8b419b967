//! Revision Sequencer.
//!
//! Allocates the next revision for a `(bucket_id, key)` atomically and
//! serializes concurrent writers, the way `kv-core`'s teacher implemented
//! MVCC timestamp allocation off a single `Key::NextVersion` counter --
//! here the counter is per-key rather than global, and the lock point is a
//! Postgres row rather than an in-process mutex.
//!
//! ```text
//! INSERT INTO kv_revision_sequences (bucket_id, key, current_revision)
//! VALUES ($1, $2, 1)
//! ON CONFLICT (bucket_id, key)
//! DO UPDATE SET current_revision = kv_revision_sequences.current_revision + 1
//! RETURNING current_revision
//! ```
//!
//! The row lock acquired by `ON CONFLICT DO UPDATE` *is* the per-key
//! critical section -- there is no application-level mutex. Two concurrent
//! writers to the same key serialize on this row: whichever transaction's
//! upsert commits first gets the lower revision, and the second writer's
//! upsert blocks until the first commits or rolls back.
//!
//! Ordering guarantee: for any two writes W1, W2 to the same key, their
//! commit order strictly implies `W1.revision < W2.revision`. Writes to
//! different keys never contend with each other.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::CResult;

/// Allocates (and increments) the next revision for `key` in `bucket_id`,
/// holding the row lock until `tx` commits or rolls back.
pub async fn allocate_next(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: &str,
) -> CResult<i64> {
    let revision: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO kv_revision_sequences (bucket_id, key, current_revision)
        VALUES ($1, $2, 1)
        ON CONFLICT (bucket_id, key)
        DO UPDATE SET current_revision = kv_revision_sequences.current_revision + 1
        RETURNING current_revision
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .fetch_one(&mut **tx)
    .await?;
    Ok(revision)
}

/// Acquires the same row lock without incrementing -- used by CAS as its
/// serialization point (step 1 of the CAS protocol), so the
/// expected-revision check and the subsequent Put happen atomically with
/// respect to any other writer or CAS on the same key.
pub async fn peek_current(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    key: &str,
) -> CResult<i64> {
    let revision: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO kv_revision_sequences (bucket_id, key, current_revision)
        VALUES ($1, $2, 0)
        ON CONFLICT (bucket_id, key)
        DO UPDATE SET current_revision = kv_revision_sequences.current_revision + 0
        RETURNING current_revision
        "#,
    )
    .bind(bucket_id)
    .bind(key)
    .fetch_one(&mut **tx)
    .await?;
    Ok(revision)
}
