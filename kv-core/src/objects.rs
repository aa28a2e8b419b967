//! Object Chunk Pipeline: begin / write chunk / finalize, ranged reads,
//! and integrity verification over the shared chunk table.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::digest::{chunk_digest, StreamingDigest};
use crate::error::{CResult, Error};
use crate::model::{ObjectBucket, ObjectMetadata};
use crate::repo::object_repo;

/// An in-flight upload. Carries the bucket's `chunk_size`/`max_object_size`
/// snapshotted at `begin` time -- a bucket's limits changing mid-upload
/// must not retroactively invalidate bytes already accepted.
pub struct UploadSession {
    pub metadata_id: Uuid,
    pub bucket_id: Uuid,
    chunk_size: i64,
    max_object_size: i64,
    next_index: i32,
    total_size: i64,
    digest: StreamingDigest,
}

pub async fn begin(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &ObjectBucket,
    name: &str,
    content_type: Option<&str>,
    description: Option<&str>,
    headers: serde_json::Value,
) -> CResult<UploadSession> {
    if name.is_empty() {
        return Err(Error::Validation("object name must not be empty".into()));
    }
    let metadata = object_repo::begin_object(
        tx,
        bucket.id,
        bucket.tenant.as_deref(),
        name,
        content_type,
        description,
        headers,
    )
    .await?;
    Ok(UploadSession {
        metadata_id: metadata.id,
        bucket_id: bucket.id,
        chunk_size: bucket.chunk_size,
        max_object_size: bucket.max_object_size,
        next_index: 0,
        total_size: 0,
        digest: StreamingDigest::new(),
    })
}

impl UploadSession {
    /// Accepts one chunk of the upload body. Callers are expected to
    /// split the stream at `chunk_size` boundaries (the last chunk may be
    /// shorter); this function does not re-chunk an oversized slice.
    pub async fn write_chunk(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
        body: &[u8],
    ) -> CResult<()> {
        if body.len() as i64 > self.chunk_size {
            return Err(Error::Validation(format!(
                "chunk of {} bytes exceeds bucket chunk_size of {}",
                body.len(),
                self.chunk_size
            )));
        }
        self.total_size += body.len() as i64;
        if self.total_size > self.max_object_size {
            return Err(Error::Validation(format!(
                "object exceeds bucket max_object_size of {}",
                self.max_object_size
            )));
        }
        let digest = chunk_digest(body);
        object_repo::upsert_chunk(tx, &digest, body).await?;
        object_repo::link_chunk(tx, self.metadata_id, self.next_index, &digest).await?;
        self.digest.update(body);
        self.next_index += 1;
        Ok(())
    }

    /// Commits the upload, computing the whole-object digest from every
    /// chunk seen so far. The object becomes visible to `get`/`list` only
    /// after this returns.
    pub async fn finalize(self, tx: &mut Transaction<'_, Postgres>) -> CResult<ObjectMetadata> {
        let digest = self.digest.finalize();
        object_repo::finalize_object(tx, self.metadata_id, self.total_size, self.next_index, &digest)
            .await
    }

    pub async fn abort(self, tx: &mut Transaction<'_, Postgres>) -> CResult<()> {
        object_repo::fail_object(tx, self.metadata_id).await
    }
}

/// Transitions an upload to `FAILED` by metadata id alone, for the one
/// failure path where the `UploadSession` itself is gone -- `finalize`
/// consumes `self`, so a failed finalize call can't hand its
/// `UploadSession` to [`UploadSession::abort`].
pub async fn mark_failed(tx: &mut Transaction<'_, Postgres>, metadata_id: Uuid) -> CResult<()> {
    object_repo::fail_object(tx, metadata_id).await
}

pub async fn get_metadata(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &ObjectBucket,
    name: &str,
) -> CResult<ObjectMetadata> {
    object_repo::get_metadata(tx, bucket.id, name).await
}

pub async fn list_objects(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &ObjectBucket,
    prefix: Option<&str>,
    limit: i64,
    offset: i64,
) -> CResult<Vec<ObjectMetadata>> {
    object_repo::list_objects(tx, bucket.id, prefix, limit, offset).await
}

pub async fn delete_object(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &ObjectBucket,
    name: &str,
) -> CResult<()> {
    let metadata = object_repo::get_metadata(tx, bucket.id, name).await?;
    object_repo::delete_object(tx, metadata.id).await
}

/// Reads `[start, end)` of an object's body, assembled from only the
/// chunks that overlap the range -- chunks entirely outside the window
/// are never fetched from `obj_chunks`. `end` of `None` means "to EOF".
pub async fn read_range(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &ObjectBucket,
    name: &str,
    start: i64,
    end: Option<i64>,
) -> CResult<Vec<u8>> {
    let metadata = object_repo::get_metadata(tx, bucket.id, name).await?;
    let end = end.unwrap_or(metadata.size).min(metadata.size);
    if start < 0 {
        return Err(Error::Validation("range offset must not be negative".into()));
    }
    if start > end {
        return Err(Error::UnsatisfiableRange);
    }
    let links = object_repo::list_chunk_links(tx, metadata.id).await?;
    let chunk_size = bucket.chunk_size;
    let mut out = Vec::with_capacity((end - start) as usize);
    for link in links {
        let chunk_start = link.chunk_index as i64 * chunk_size;
        let chunk_end = chunk_start + chunk_size;
        if chunk_end <= start || chunk_start >= end {
            continue;
        }
        let body = object_repo::get_chunk_body(tx, &link.chunk_digest).await?;
        let lo = (start - chunk_start).max(0) as usize;
        let hi = ((end - chunk_start) as usize).min(body.len());
        out.extend_from_slice(&body[lo..hi]);
    }
    Ok(out)
}

/// Recomputes the digest over an object's stored chunks and compares it
/// against the recorded digest.
pub async fn verify(
    tx: &mut Transaction<'_, Postgres>,
    bucket: &ObjectBucket,
    name: &str,
) -> CResult<bool> {
    let metadata = object_repo::get_metadata(tx, bucket.id, name).await?;
    let links = object_repo::list_chunk_links(tx, metadata.id).await?;
    let mut digest = StreamingDigest::new();
    for link in links {
        let body = object_repo::get_chunk_body(tx, &link.chunk_digest).await?;
        digest.update(&body);
    }
    Ok(digest.finalize() == metadata.digest)
}

pub async fn create_bucket(
    tx: &mut Transaction<'_, Postgres>,
    tenant: Option<&str>,
    name: &str,
    chunk_size: i64,
    max_object_size: i64,
) -> CResult<ObjectBucket> {
    if name.is_empty() {
        return Err(Error::Validation("bucket name must not be empty".into()));
    }
    object_repo::create_bucket(tx, tenant, name, chunk_size, max_object_size).await
}

pub async fn get_bucket(tx: &mut Transaction<'_, Postgres>, name: &str) -> CResult<ObjectBucket> {
    object_repo::get_bucket_by_name(tx, name).await
}

pub async fn list_buckets(tx: &mut Transaction<'_, Postgres>) -> CResult<Vec<ObjectBucket>> {
    object_repo::list_buckets(tx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_overlap_math_matches_expected_windows() {
        let chunk_size: i64 = 4;
        let chunk_index: i64 = 2;
        let chunk_start = chunk_index * chunk_size;
        let chunk_end = chunk_start + chunk_size;
        assert_eq!(chunk_start, 8);
        assert_eq!(chunk_end, 12);

        let (start, end) = (5i64, 10i64);
        assert!(!(chunk_end <= start || chunk_start >= end));
    }
}
