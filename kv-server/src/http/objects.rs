//! Object bucket and upload/download routes. Upload and download
//! bodies are raw `application/octet-stream`, not JSON; everything else
//! mirrors the KV bucket surface in [`crate::http::kv`].

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use kv_core::model::ObjectBucket;
use kv_core::objects;
use kv_core::tenant::TenantSession;
use serde::{Deserialize, Serialize};

use crate::http::authz::RoleGate;
use crate::http::error::ApiError;
use crate::state::AppState;

const TENANT_HEADER: &str = "x-tenant-id";
const OBJECT_DESCRIPTION_HEADER: &str = "x-object-description";

fn tenant_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/objects/buckets",
            axum::routing::post(create_bucket).get(list_buckets),
        )
        .route("/api/v1/objects/buckets/:bucket", get(get_bucket))
        .route(
            "/api/v1/objects/buckets/:bucket/objects",
            get(list_objects),
        )
        .route(
            "/api/v1/objects/buckets/:bucket/objects/:name",
            axum::routing::put(upload_object)
                .get(download_object)
                .delete(delete_object),
        )
        .route(
            "/api/v1/objects/buckets/:bucket/objects/:name/metadata",
            get(get_metadata),
        )
        .route(
            "/api/v1/objects/buckets/:bucket/objects/:name/verify",
            get(verify_object),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateObjectBucketRequest {
    name: String,
    chunk_size: Option<i64>,
    max_object_size: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketView {
    id: uuid::Uuid,
    tenant: Option<String>,
    name: String,
    chunk_size: i64,
    max_object_size: i64,
}

impl From<ObjectBucket> for BucketView {
    fn from(b: ObjectBucket) -> Self {
        BucketView {
            id: b.id,
            tenant: b.tenant,
            name: b.name,
            chunk_size: b.chunk_size,
            max_object_size: b.max_object_size,
        }
    }
}

async fn create_bucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    _role: RoleGate,
    Json(req): Json<CreateObjectBucketRequest>,
) -> Result<(StatusCode, Json<BucketView>), ApiError> {
    let path = "/api/v1/objects/buckets".to_string();
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let bucket = objects::create_bucket(
        &mut session.tx,
        tenant.as_deref(),
        &req.name,
        req.chunk_size.unwrap_or(state.config.objectstore_chunk_size),
        req.max_object_size
            .unwrap_or(state.config.objectstore_max_object_size),
    )
    .await
    .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    state.watch.note_obj_bucket_name(bucket.id, &bucket.name);
    Ok((StatusCode::CREATED, Json(bucket.into())))
}

async fn list_buckets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<BucketView>>, ApiError> {
    let path = "/api/v1/objects/buckets".to_string();
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let buckets = objects::list_buckets(&mut session.tx)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(buckets.into_iter().map(BucketView::from).collect()))
}

async fn resolve_bucket(
    session: &mut TenantSession,
    name: &str,
    path: &str,
) -> Result<ObjectBucket, ApiError> {
    objects::get_bucket(&mut session.tx, name)
        .await
        .map_err(|e| ApiError::new(e, path.to_string()))
}

async fn get_bucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Result<Json<BucketView>, ApiError> {
    let path = format!("/api/v1/objects/buckets/{bucket}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(found.into()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadataView {
    name: String,
    size: i64,
    chunk_count: i32,
    digest: String,
    digest_algorithm: String,
    content_type: Option<String>,
    description: Option<String>,
    status: &'static str,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<kv_core::model::ObjectMetadata> for ObjectMetadataView {
    fn from(m: kv_core::model::ObjectMetadata) -> Self {
        ObjectMetadataView {
            name: m.name,
            size: m.size,
            chunk_count: m.chunk_count,
            digest: m.digest,
            digest_algorithm: m.digest_algorithm,
            content_type: m.content_type,
            description: m.description,
            status: match m.status {
                kv_core::model::ObjectStatus::Uploading => "UPLOADING",
                kv_core::model::ObjectStatus::Completed => "COMPLETED",
                kv_core::model::ObjectStatus::Failed => "FAILED",
            },
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListObjectsQuery {
    prefix: Option<String>,
}

async fn list_objects(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Json<Vec<ObjectMetadataView>>, ApiError> {
    let path = format!("/api/v1/objects/buckets/{bucket}/objects");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let objs = objects::list_objects(&mut session.tx, &found, q.prefix.as_deref(), 10_000, 0)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(objs.into_iter().map(ObjectMetadataView::from).collect()))
}

async fn get_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Json<ObjectMetadataView>, ApiError> {
    let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}/metadata");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let metadata = objects::get_metadata(&mut session.tx, &found, &name)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(metadata.into()))
}

/// Aborts an in-flight upload in its own compensating transaction,
/// transitioning it to `FAILED`. Best-effort: if even the compensating
/// transaction fails, the upload is left `UPLOADING` forever and only
/// logged, since there's no request left to report it to.
async fn abort_upload(state: &AppState, tenant: Option<&str>, upload: objects::UploadSession) {
    let metadata_id = upload.metadata_id;
    match TenantSession::bind(&state.pool, tenant).await {
        Ok(mut session) => {
            if let Err(e) = upload.abort(&mut session.tx).await {
                log::error!("failed to mark upload {metadata_id} as FAILED: {e}");
                return;
            }
            if let Err(e) = session.commit().await {
                log::error!("failed to commit FAILED status for upload {metadata_id}: {e}");
            }
        }
        Err(e) => {
            log::error!("failed to bind compensating transaction for upload {metadata_id}: {e}")
        }
    }
}

/// Same as [`abort_upload`] but for the one failure path where the
/// `UploadSession` is already gone -- `finalize` consumes `self`, so a
/// failed finalize call only has `metadata_id` left to work with.
async fn mark_upload_failed(state: &AppState, tenant: Option<&str>, metadata_id: uuid::Uuid) {
    match TenantSession::bind(&state.pool, tenant).await {
        Ok(mut session) => {
            if let Err(e) = objects::mark_failed(&mut session.tx, metadata_id).await {
                log::error!("failed to mark upload {metadata_id} as FAILED: {e}");
                return;
            }
            if let Err(e) = session.commit().await {
                log::error!("failed to commit FAILED status for upload {metadata_id}: {e}");
            }
        }
        Err(e) => {
            log::error!("failed to bind compensating transaction for upload {metadata_id}: {e}")
        }
    }
}

/// Uploads the whole body in one piece, splitting it into bucket-sized
/// chunks before handing each to the chunk pipeline -- simpler than a
/// true streaming upload, and acceptable since axum already buffers the
/// request body to `Bytes` before the handler runs.
///
/// Begin, each chunk, and Finalize each run in their own transaction:
/// the upload is visible as `UPLOADING` as soon as Begin commits, and any
/// failure in a later phase leaves the chunks already written and linked
/// in place, transitioning the metadata row to `FAILED` in a separate
/// compensating transaction rather than rolling the whole upload back.
async fn upload_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ObjectMetadataView>, ApiError> {
    let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}");
    let tenant = tenant_from_headers(&headers);
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let description = headers
        .get(OBJECT_DESCRIPTION_HEADER)
        .and_then(|v| v.to_str().ok());

    let mut begin_session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut begin_session, &bucket, &path).await?;
    let mut upload = objects::begin(
        &mut begin_session.tx,
        &found,
        &name,
        content_type,
        description,
        serde_json::Value::Null,
    )
    .await
    .map_err(|e| ApiError::new(e, path.clone()))?;
    begin_session
        .commit()
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;

    let chunk_size = found.chunk_size.max(1) as usize;
    for chunk in body.chunks(chunk_size) {
        let mut chunk_session = match TenantSession::bind(&state.pool, tenant.as_deref()).await {
            Ok(s) => s,
            Err(e) => {
                abort_upload(&state, tenant.as_deref(), upload).await;
                return Err(ApiError::new(e, path));
            }
        };
        if let Err(e) = upload.write_chunk(&mut chunk_session.tx, chunk).await {
            abort_upload(&state, tenant.as_deref(), upload).await;
            return Err(ApiError::new(e, path));
        }
        if let Err(e) = chunk_session.commit().await {
            abort_upload(&state, tenant.as_deref(), upload).await;
            return Err(ApiError::new(e, path));
        }
    }

    let metadata_id = upload.metadata_id;
    let mut finalize_session = match TenantSession::bind(&state.pool, tenant.as_deref()).await {
        Ok(s) => s,
        Err(e) => {
            mark_upload_failed(&state, tenant.as_deref(), metadata_id).await;
            return Err(ApiError::new(e, path));
        }
    };
    let metadata = match upload.finalize(&mut finalize_session.tx).await {
        Ok(m) => m,
        Err(e) => {
            mark_upload_failed(&state, tenant.as_deref(), metadata_id).await;
            return Err(ApiError::new(e, path));
        }
    };
    finalize_session
        .commit()
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;

    state.watch.note_obj_bucket_name(found.id, &found.name);
    Ok(Json(metadata.into()))
}

#[derive(Debug, Default)]
struct ByteRange {
    start: i64,
    end: Option<i64>,
}

fn parse_range(header: &str, size: i64) -> Result<Option<ByteRange>, kv_core::error::Error> {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Ok(None);
    };
    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| kv_core::error::Error::Validation("malformed Range header".into()))?;

    if start_str.is_empty() {
        let suffix_len: i64 = end_str
            .parse()
            .map_err(|_| kv_core::error::Error::Validation("malformed Range header".into()))?;
        let start = (size - suffix_len).max(0);
        return Ok(Some(ByteRange { start, end: Some(size) }));
    }

    let start: i64 = start_str
        .parse()
        .map_err(|_| kv_core::error::Error::Validation("malformed Range header".into()))?;
    let end = if end_str.is_empty() {
        None
    } else {
        let e: i64 = end_str
            .parse()
            .map_err(|_| kv_core::error::Error::Validation("malformed Range header".into()))?;
        Some(e + 1)
    };
    if start >= size || end.is_some_and(|e| e > size) {
        return Err(kv_core::error::Error::UnsatisfiableRange);
    }
    Ok(Some(ByteRange { start, end }))
}

async fn download_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let metadata = objects::get_metadata(&mut session.tx, &found, &name)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;

    let range_header = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok());
    let range = match range_header {
        Some(h) => parse_range(h, metadata.size).map_err(|e| ApiError::new(e, path.clone()))?,
        None => None,
    };

    let (start, end, status) = match &range {
        Some(r) => (r.start, r.end.unwrap_or(metadata.size), StatusCode::PARTIAL_CONTENT),
        None => (0, metadata.size, StatusCode::OK),
    };

    let bytes = objects::read_range(&mut session.tx, &found, &name, start, Some(end))
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;

    let mut response = (status, bytes).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        "x-object-digest",
        HeaderValue::from_str(&metadata.digest).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response_headers.insert(
        "x-object-digest-algorithm",
        HeaderValue::from_str(&metadata.digest_algorithm)
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response_headers.insert(
        axum::http::header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    if range.is_some() {
        response_headers.insert(
            axum::http::header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{}/{}", end - 1, metadata.size))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
    }
    Ok(response)
}

async fn delete_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    objects::delete_object(&mut session.tx, &found, &name)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    valid: bool,
    message: String,
}

async fn verify_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let path = format!("/api/v1/objects/buckets/{bucket}/objects/{name}/verify");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let valid = objects::verify(&mut session.tx, &found, &name)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    let message = if valid {
        "digest matches stored chunks".to_string()
    } else {
        "digest mismatch against stored chunks".to_string()
    };
    Ok(Json(VerifyResponse { valid, message }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_closed_range() {
        let range = parse_range("bytes=10-14", 36).unwrap().unwrap();
        assert_eq!(range.start, 10);
        assert_eq!(range.end, Some(15));
    }

    #[test]
    fn parses_a_suffix_range() {
        let range = parse_range("bytes=30-", 36).unwrap().unwrap();
        assert_eq!(range.start, 30);
        assert_eq!(range.end, None);
    }

    #[test]
    fn rejects_a_range_starting_past_the_end() {
        let err = parse_range("bytes=100-200", 36).unwrap_err();
        assert!(matches!(err, kv_core::error::Error::UnsatisfiableRange));
    }
}
