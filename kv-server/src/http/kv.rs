//! KV bucket and key routes.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use kv_core::model::{KvBucket, KvEntry};
use kv_core::tenant::TenantSession;
use kv_core::{kv, repo::kv_repo};
use serde::{Deserialize, Serialize};

use crate::http::authz::RoleGate;
use crate::http::error::ApiError;
use crate::state::AppState;

const TENANT_HEADER: &str = "x-tenant-id";

fn tenant_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/kv/buckets", axum::routing::post(create_bucket).get(list_buckets))
        .route(
            "/api/v1/kv/buckets/:bucket",
            get(get_bucket).put(update_bucket).delete(delete_bucket),
        )
        .route("/api/v1/kv/buckets/:bucket/purge", delete(purge_bucket))
        .route("/api/v1/kv/buckets/:bucket/keys", get(list_keys))
        .route(
            "/api/v1/kv/buckets/:bucket/keys/:key",
            get(get_key).put(put_key).delete(delete_key),
        )
        .route("/api/v1/kv/buckets/:bucket/keys/:key/purge", delete(purge_key))
        .route(
            "/api/v1/kv/buckets/:bucket/keys/:key/revision/:n",
            get(get_key_revision),
        )
        .route(
            "/api/v1/kv/buckets/:bucket/keys/:key/history",
            get(key_history),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucketRequest {
    name: String,
    description: Option<String>,
    max_value_size: Option<i64>,
    max_history_per_key: Option<i64>,
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketView {
    id: uuid::Uuid,
    tenant: Option<String>,
    name: String,
    description: Option<String>,
    max_value_size: i64,
    max_history_per_key: i64,
    ttl_seconds: Option<i64>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<KvBucket> for BucketView {
    fn from(b: KvBucket) -> Self {
        BucketView {
            id: b.id,
            tenant: b.tenant,
            name: b.name,
            description: b.description,
            max_value_size: b.max_value_size,
            max_history_per_key: b.max_history_per_key,
            ttl_seconds: b.ttl_seconds,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

async fn create_bucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    _role: RoleGate,
    Json(req): Json<CreateBucketRequest>,
) -> Result<(StatusCode, Json<BucketView>), ApiError> {
    let path = "/api/v1/kv/buckets".to_string();
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;

    let bucket = kv::create_bucket(
        &mut session.tx,
        tenant.as_deref(),
        &req.name,
        req.description.as_deref(),
        req.max_value_size.unwrap_or(state.config.kv_max_value_size),
        req.max_history_per_key.unwrap_or(state.config.kv_max_history_size),
        req.ttl_seconds,
    )
    .await
    .map_err(|e| ApiError::new(e, path.clone()))?;

    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    state.watch.note_kv_bucket_name(bucket.id, &bucket.name);
    Ok((StatusCode::CREATED, Json(bucket.into())))
}

async fn list_buckets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<BucketView>>, ApiError> {
    let path = "/api/v1/kv/buckets".to_string();
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let buckets = kv::list_buckets(&mut session.tx)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(buckets.into_iter().map(BucketView::from).collect()))
}

async fn resolve_bucket(
    session: &mut TenantSession,
    name: &str,
    path: &str,
) -> Result<KvBucket, ApiError> {
    kv::get_bucket(&mut session.tx, name)
        .await
        .map_err(|e| ApiError::new(e, path.to_string()))
}

async fn get_bucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Result<Json<BucketView>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(found.into()))
}

async fn update_bucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
    Json(req): Json<CreateBucketRequest>,
) -> Result<Json<BucketView>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let existing = resolve_bucket(&mut session, &bucket, &path).await?;
    let updated = kv_repo::update_bucket_limits(
        &mut session.tx,
        existing.id,
        req.description.as_deref().or(existing.description.as_deref()),
        req.max_value_size.unwrap_or(existing.max_value_size),
        req.max_history_per_key.unwrap_or(existing.max_history_per_key),
        req.ttl_seconds.or(existing.ttl_seconds),
    )
    .await
    .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(updated.into()))
}

async fn delete_bucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Result<StatusCode, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    kv::delete_bucket(&mut session.tx, &bucket)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct CountResponse {
    count: u64,
}

async fn purge_bucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/purge");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let keys = kv_repo::list_latest_entries(&mut session.tx, found.id, None, i64::MAX, 0)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let mut count = 0u64;
    for entry in keys {
        count += kv_repo::purge_key(&mut session.tx, found.id, &entry.key)
            .await
            .map_err(|e| ApiError::new(e, path.clone()))?;
    }
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(CountResponse { count }))
}

#[derive(Debug, Deserialize)]
struct ListKeysQuery {
    prefix: Option<String>,
}

async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
    Query(q): Query<ListKeysQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/keys");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let entries = kv::list_keys(&mut session.tx, &found, q.prefix.as_deref(), 10_000, 0, Utc::now())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(entries.into_iter().map(|e| e.key).collect::<Vec<_>>()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryView {
    key: String,
    value: Option<String>,
    revision: i64,
    operation: &'static str,
    created_at: chrono::DateTime<Utc>,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl From<KvEntry> for EntryView {
    fn from(e: KvEntry) -> Self {
        EntryView {
            key: e.key,
            value: e
                .value
                .as_ref()
                .map(|v| base64::engine::general_purpose::STANDARD.encode(v)),
            revision: e.revision,
            operation: e.operation.as_str(),
            created_at: e.created_at,
            expires_at: e.expires_at,
        }
    }
}

async fn get_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<EntryView>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let entry = kv::get(&mut session.tx, &found, &key, Utc::now())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(entry.into()))
}

async fn get_key_revision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, key, n)): Path<(String, String, i64)>,
) -> Result<Json<EntryView>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}/revision/{n}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let entry = kv_repo::get_at_revision(&mut session.tx, found.id, &key, n)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?
        .ok_or_else(|| ApiError::new(kv_core::error::Error::NotFound, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(entry.into()))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn key_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<EntryView>>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}/history");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let entries = kv::history(&mut session.tx, &found, &key, q.limit.unwrap_or(100))
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(entries.into_iter().map(EntryView::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutValueRequest {
    value: String,
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CasQuery {
    #[serde(rename = "expectedRevision")]
    expected_revision: Option<i64>,
}

async fn put_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<CasQuery>,
    Json(req): Json<PutValueRequest>,
) -> Result<Json<EntryView>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}");
    let tenant = tenant_from_headers(&headers);
    let value = base64::engine::general_purpose::STANDARD
        .decode(&req.value)
        .map_err(|e| {
            ApiError::new(
                kv_core::error::Error::Validation(format!("invalid base64 value: {e}")),
                path.clone(),
            )
        })?;

    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let now = Utc::now();

    let entry = match q.expected_revision {
        Some(expected) => {
            kv::compare_and_swap(
                &mut session.tx,
                &found,
                &key,
                expected,
                &value,
                req.ttl_seconds,
                now,
            )
            .await
        }
        None => kv::put(&mut session.tx, &found, &key, &value, req.ttl_seconds, now).await,
    }
    .map_err(|e| ApiError::new(e, path.clone()))?;

    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(entry.into()))
}

async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<EntryView>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let entry = kv::delete(&mut session.tx, &found, &key, Utc::now())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(entry.into()))
}

async fn purge_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<CountResponse>, ApiError> {
    let path = format!("/api/v1/kv/buckets/{bucket}/keys/{key}/purge");
    let tenant = tenant_from_headers(&headers);
    let mut session = TenantSession::bind(&state.pool, tenant.as_deref())
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    let found = resolve_bucket(&mut session, &bucket, &path).await?;
    let count = kv_repo::purge_key(&mut session.tx, found.id, &key)
        .await
        .map_err(|e| ApiError::new(e, path.clone()))?;
    session.commit().await.map_err(|e| ApiError::new(e, path.clone()))?;
    Ok(Json(CountResponse { count }))
}
