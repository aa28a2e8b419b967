//! Hand-written SQL for object buckets, metadata, and the shared chunk
//! table. Grounded on the dedup/link-table shape in `ChunkStore` (see
//! other_examples: `KogSector-ConHub` chunk store, `upsert_chunk` +
//! `ON CONFLICT ... DO UPDATE` to share chunk bodies across objects).

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::CResult;
use crate::model::{MetadataChunkLink, ObjectBucket, ObjectMetadata};

pub async fn create_bucket(
    tx: &mut Transaction<'_, Postgres>,
    tenant: Option<&str>,
    name: &str,
    chunk_size: i64,
    max_object_size: i64,
) -> CResult<ObjectBucket> {
    let bucket = sqlx::query_as::<_, ObjectBucket>(
        r#"
        INSERT INTO obj_buckets (tenant, name, chunk_size, max_object_size)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(tenant)
    .bind(name)
    .bind(chunk_size)
    .bind(max_object_size)
    .fetch_one(&mut **tx)
    .await?;
    Ok(bucket)
}

pub async fn get_bucket_by_name(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
) -> CResult<ObjectBucket> {
    let bucket = sqlx::query_as::<_, ObjectBucket>("SELECT * FROM obj_buckets WHERE name = $1")
        .bind(name)
        .fetch_one(&mut **tx)
        .await?;
    Ok(bucket)
}

pub async fn list_buckets(tx: &mut Transaction<'_, Postgres>) -> CResult<Vec<ObjectBucket>> {
    let buckets = sqlx::query_as::<_, ObjectBucket>("SELECT * FROM obj_buckets ORDER BY name")
        .fetch_all(&mut **tx)
        .await?;
    Ok(buckets)
}

/// Opens an upload: inserts a metadata row in `Uploading` status with no
/// digest yet. The caller streams chunks in next and finalizes once the
/// whole body has been seen.
pub async fn begin_object(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    tenant: Option<&str>,
    name: &str,
    content_type: Option<&str>,
    description: Option<&str>,
    headers: serde_json::Value,
) -> CResult<ObjectMetadata> {
    let metadata = sqlx::query_as::<_, ObjectMetadata>(
        r#"
        INSERT INTO obj_metadata
            (bucket_id, tenant, name, size, chunk_count, digest, digest_algorithm,
             content_type, description, headers, status)
        VALUES ($1, $2, $3, 0, 0, '', 'sha256', $4, $5, $6, 'UPLOADING')
        ON CONFLICT (bucket_id, name) DO UPDATE SET
            content_type = EXCLUDED.content_type,
            description = EXCLUDED.description,
            headers = EXCLUDED.headers,
            status = 'UPLOADING',
            size = 0,
            chunk_count = 0,
            digest = '',
            updated_at = now()
        RETURNING *
        "#,
    )
    .bind(bucket_id)
    .bind(tenant)
    .bind(name)
    .bind(content_type)
    .bind(description)
    .bind(headers)
    .fetch_one(&mut **tx)
    .await?;
    Ok(metadata)
}

/// Stores (or dedups against) a chunk body and links it to `metadata_id`
/// at `chunk_index`. The shared chunk table is keyed by digest so two
/// objects with an identical chunk share the row -- `ON CONFLICT DO
/// NOTHING` on a digest match is the dedup point.
pub async fn upsert_chunk(
    tx: &mut Transaction<'_, Postgres>,
    digest: &str,
    body: &[u8],
) -> CResult<()> {
    sqlx::query(
        r#"
        INSERT INTO obj_chunks (digest, size, body)
        VALUES ($1, $2, $3)
        ON CONFLICT (digest) DO NOTHING
        "#,
    )
    .bind(digest)
    .bind(body.len() as i64)
    .bind(body)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn link_chunk(
    tx: &mut Transaction<'_, Postgres>,
    metadata_id: Uuid,
    chunk_index: i32,
    digest: &str,
) -> CResult<MetadataChunkLink> {
    let link = sqlx::query_as::<_, MetadataChunkLink>(
        r#"
        INSERT INTO obj_metadata_chunks (metadata_id, chunk_index, chunk_digest)
        VALUES ($1, $2, $3)
        ON CONFLICT (metadata_id, chunk_index) DO UPDATE SET chunk_digest = EXCLUDED.chunk_digest
        RETURNING *
        "#,
    )
    .bind(metadata_id)
    .bind(chunk_index)
    .bind(digest)
    .fetch_one(&mut **tx)
    .await?;
    Ok(link)
}

/// Marks an object Completed with its final digest/size/chunk_count, the
/// commit point of the chunk pipeline's Finalize step.
pub async fn finalize_object(
    tx: &mut Transaction<'_, Postgres>,
    metadata_id: Uuid,
    size: i64,
    chunk_count: i32,
    digest: &str,
) -> CResult<ObjectMetadata> {
    let metadata = sqlx::query_as::<_, ObjectMetadata>(
        r#"
        UPDATE obj_metadata
        SET size = $2, chunk_count = $3, digest = $4, status = 'COMPLETED', updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(metadata_id)
    .bind(size)
    .bind(chunk_count)
    .bind(digest)
    .fetch_one(&mut **tx)
    .await?;
    Ok(metadata)
}

pub async fn fail_object(tx: &mut Transaction<'_, Postgres>, metadata_id: Uuid) -> CResult<()> {
    sqlx::query("UPDATE obj_metadata SET status = 'FAILED', updated_at = now() WHERE id = $1")
        .bind(metadata_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn get_metadata(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    name: &str,
) -> CResult<ObjectMetadata> {
    let metadata = sqlx::query_as::<_, ObjectMetadata>(
        "SELECT * FROM obj_metadata WHERE bucket_id = $1 AND name = $2 AND status = 'COMPLETED'",
    )
    .bind(bucket_id)
    .bind(name)
    .fetch_one(&mut **tx)
    .await?;
    Ok(metadata)
}

pub async fn list_objects(
    tx: &mut Transaction<'_, Postgres>,
    bucket_id: Uuid,
    prefix: Option<&str>,
    limit: i64,
    offset: i64,
) -> CResult<Vec<ObjectMetadata>> {
    let pattern = prefix.map(|p| format!("{}%", p.replace('%', "\\%").replace('_', "\\_")));
    let objects = sqlx::query_as::<_, ObjectMetadata>(
        r#"
        SELECT * FROM obj_metadata
        WHERE bucket_id = $1 AND status = 'COMPLETED' AND ($2::text IS NULL OR name LIKE $2)
        ORDER BY name
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(bucket_id)
    .bind(pattern)
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut **tx)
    .await?;
    Ok(objects)
}

/// Chunk digests for an object in index order, the sequence a ranged
/// read walks to find which chunks overlap the requested byte range.
pub async fn list_chunk_links(
    tx: &mut Transaction<'_, Postgres>,
    metadata_id: Uuid,
) -> CResult<Vec<MetadataChunkLink>> {
    let links = sqlx::query_as::<_, MetadataChunkLink>(
        "SELECT * FROM obj_metadata_chunks WHERE metadata_id = $1 ORDER BY chunk_index",
    )
    .bind(metadata_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(links)
}

pub async fn get_chunk_body(
    tx: &mut Transaction<'_, Postgres>,
    digest: &str,
) -> CResult<Vec<u8>> {
    let body: Vec<u8> = sqlx::query_scalar("SELECT body FROM obj_chunks WHERE digest = $1")
        .bind(digest)
        .fetch_one(&mut **tx)
        .await?;
    Ok(body)
}

/// Deletes the object's metadata and chunk links, then prunes any shared
/// chunk body no longer referenced by any object (dedup's counterpart:
/// garbage-collect on the way out).
pub async fn delete_object(
    tx: &mut Transaction<'_, Postgres>,
    metadata_id: Uuid,
) -> CResult<()> {
    let result = sqlx::query("DELETE FROM obj_metadata WHERE id = $1 AND status = 'COMPLETED'")
        .bind(metadata_id)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(crate::error::Error::NotFound);
    }
    sqlx::query(
        r#"
        DELETE FROM obj_chunks
        WHERE digest NOT IN (SELECT chunk_digest FROM obj_metadata_chunks)
        "#,
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}

