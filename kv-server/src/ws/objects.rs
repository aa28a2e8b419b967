//! Object watch sockets -- simpler event shape than KV
//! watch, no replay semantics (object mutations are whole-object, not
//! revisioned).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use kv_core::objects;
use kv_core::tenant::TenantSession;
use serde::Serialize;

use crate::state::AppState;

const TENANT_HEADER: &str = "x-tenant-id";

fn tenant_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/objects/watch/:bucket", get(watch_bucket))
}

#[derive(Debug, Serialize)]
struct ConnectedFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    bucket: String,
}

async fn watch_bucket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(bucket): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| run_watch(socket, state, headers, bucket))
}

async fn run_watch(mut socket: WebSocket, state: AppState, headers: HeaderMap, bucket_name: String) {
    let tenant = tenant_from_headers(&headers);
    let bucket = {
        let mut session = match TenantSession::bind(&state.pool, tenant.as_deref()).await {
            Ok(s) => s,
            Err(e) => {
                let _ = socket.send(Message::Text(format!("{{\"type\":\"error\",\"message\":\"{e}\"}}"))).await;
                return;
            }
        };
        let found = match objects::get_bucket(&mut session.tx, &bucket_name).await {
            Ok(b) => b,
            Err(e) => {
                let _ = socket.send(Message::Text(format!("{{\"type\":\"error\",\"message\":\"{e}\"}}"))).await;
                return;
            }
        };
        let _ = session.commit().await;
        found
    };

    let connected = ConnectedFrame { kind: "connected", bucket: bucket.name.clone() };
    if socket
        .send(Message::Text(serde_json::to_string(&connected).unwrap_or_default()))
        .await
        .is_err()
    {
        return;
    }

    let channel = format!("obj:{}", bucket.id);
    let mut subscription = state.watch.subscribe(&channel, 0);

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
