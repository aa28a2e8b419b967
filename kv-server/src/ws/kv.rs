//! KV watch sockets.
//!
//! Each connection resolves its bucket once, subscribes to the
//! registry's bucket- or key-scope channel, optionally replays history
//! since a given revision, then forwards every further dispatched event
//! until the client disconnects. `"ping"` from the client gets `"pong"`
//! back; anything else is ignored rather than treated as an error.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use kv_core::model::KvWatchEvent;
use kv_core::tenant::TenantSession;
use kv_core::{kv, repo::kv_repo};
use serde::{Deserialize, Serialize};

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
        .route("/api/v1/kv/watch/:bucket", get(watch_bucket))
        .route("/api/v1/kv/watch/:bucket/:key", get(watch_key))
}

#[derive(Debug, Deserialize)]
struct WatchQuery {
    since: Option<i64>,
    replay: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    since: i64,
}

async fn watch_bucket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
    Query(q): Query<WatchQuery>,
) -> Response {
    ws.on_upgrade(move |socket| run_watch(socket, state, headers, bucket, None, q))
}

async fn watch_key(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<WatchQuery>,
) -> Response {
    ws.on_upgrade(move |socket| run_watch(socket, state, headers, bucket, Some(key), q))
}

async fn run_watch(
    mut socket: WebSocket,
    state: AppState,
    headers: HeaderMap,
    bucket_name: String,
    key: Option<String>,
    q: WatchQuery,
) {
    let tenant = tenant_from_headers(&headers);
    let bucket = {
        let mut session = match TenantSession::bind(&state.pool, tenant.as_deref()).await {
            Ok(s) => s,
            Err(e) => {
                let _ = socket.send(Message::Text(format!("{{\"type\":\"error\",\"message\":\"{e}\"}}"))).await;
                return;
            }
        };
        let found = match kv::get_bucket(&mut session.tx, &bucket_name).await {
            Ok(b) => b,
            Err(e) => {
                let _ = socket.send(Message::Text(format!("{{\"type\":\"error\",\"message\":\"{e}\"}}"))).await;
                return;
            }
        };
        let _ = session.commit().await;
        found
    };

    let since = q.since.unwrap_or(0);
    let connected = ConnectedFrame {
        kind: "connected",
        bucket: bucket.name.clone(),
        key: key.clone(),
        since,
    };
    if socket
        .send(Message::Text(serde_json::to_string(&connected).unwrap_or_default()))
        .await
        .is_err()
    {
        return;
    }

    let channel = match &key {
        Some(k) => format!("kv:{}:{}", bucket.id, k),
        None => format!("kv:{}", bucket.id),
    };
    let mut subscription = state.watch.subscribe(&channel, since);

    if q.replay.unwrap_or(false) {
        let mut session = match TenantSession::bind(&state.pool, tenant.as_deref()).await {
            Ok(s) => s,
            Err(_) => return,
        };
        let replayed =
            kv_repo::list_entries_since(&mut session.tx, bucket.id, key.as_deref(), since).await;
        let _ = session.commit().await;
        if let Ok(entries) = replayed {
            for entry in entries {
                let event = KvWatchEvent {
                    kind: entry.operation.as_str().to_string(),
                    bucket: bucket.name.clone(),
                    key: entry.key,
                    value: entry.value.as_ref().map(|v| {
                        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, v)
                    }),
                    revision: entry.revision,
                    timestamp: entry.created_at,
                };
                if socket
                    .send(Message::Text(serde_json::to_string(&event).unwrap_or_default()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        if socket.send(Message::Text("pong".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = subscription.receiver.recv() => {
                match event {
                    Some(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.watch.unsubscribe(&channel, subscription.id);
}
