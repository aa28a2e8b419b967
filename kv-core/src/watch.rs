//! Watch Fan-out.
//!
//! Writers `pg_notify` on commit (via triggers installed in the
//! migrations, not from Rust) and a single background task holds a
//! `PgListener` subscription, decoding each notification and handing it
//! to every interested subscriber's bounded channel. A slow subscriber
//! that can't keep up gets dropped rather than allowed to block the
//! fan-out task -- the `try_send` below is deliberate.
//!
//! Channel keys route by bucket id, never bucket name: two tenants may
//! each own a bucket named `shared`, and only the id
//! disambiguates them. The bucket name carried in the dispatched event
//! JSON is resolved from a small id→name cache, refreshed on a miss; if
//! the lookup still fails the event is dropped rather than sent with a
//! missing name, which can happen briefly if a watcher connects in the
//! same instant as the bucket it's watching is created.
//!
//! Each subscriber also carries its own `since` watermark, set at
//! subscribe time, so a caller that replays history before subscribing
//! doesn't see the tail of that replay delivered a second time as a live
//! event.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CResult, Error};
use crate::model::{KvWatchEvent, ObjectWatchEvent};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Deserialize)]
struct KvChangePayload {
    #[serde(rename = "type")]
    kind: String,
    bucket_id: Uuid,
    key: String,
    revision: i64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Deserialize)]
struct ObjChangePayload {
    #[serde(rename = "type")]
    kind: String,
    bucket_id: Uuid,
    name: String,
    size: Option<i64>,
    digest: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Keys subscribers by a logical channel -- `"kv:<bucket_id>"` for a
/// bucket-scope watcher, `"kv:<bucket_id>:<key>"` for a key-scope one,
/// `"obj:<bucket_id>"` for objects -- and fans out serialized
/// [`KvWatchEvent`]/[`ObjectWatchEvent`] frames to each one.
#[derive(Clone, Default)]
pub struct WatchRegistry {
    subscribers: Arc<DashMap<String, Vec<(Uuid, i64, mpsc::Sender<String>)>>>,
    kv_bucket_names: Arc<DashMap<Uuid, String>>,
    obj_bucket_names: Arc<DashMap<Uuid, String>>,
}

pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<String>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to `channel`, filtering out any later-dispatched event
    /// whose revision doesn't exceed `since` -- a replay already covered
    /// everything up to `since`, so live delivery must not repeat it.
    /// `since` has no effect on channels dispatched with `revision: None`
    /// (object events, which carry no revision).
    pub fn subscribe(&self, channel: &str, since: i64) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push((id, since, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, channel: &str, id: Uuid) {
        if let Some(mut entry) = self.subscribers.get_mut(channel) {
            entry.retain(|(sub_id, _, _)| *sub_id != id);
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers.get(channel).map(|e| e.len()).unwrap_or(0)
    }

    /// Seeds or refreshes the bucket id→name cache, called on bucket
    /// creation so a watcher opened moments later never races the cache.
    pub fn note_kv_bucket_name(&self, bucket_id: Uuid, name: &str) {
        self.kv_bucket_names.insert(bucket_id, name.to_string());
    }

    pub fn note_obj_bucket_name(&self, bucket_id: Uuid, name: &str) {
        self.obj_bucket_names.insert(bucket_id, name.to_string());
    }

    /// Fans `payload` out to every subscriber of `channel`. `revision`,
    /// when `Some`, is compared against each subscriber's own `since`
    /// watermark -- a subscriber whose replay already covered this
    /// revision is skipped for this event but stays subscribed for the
    /// next one. `None` (object events) always delivers.
    fn dispatch(&self, channel: &str, payload: &str, revision: Option<i64>) {
        if let Some(mut entry) = self.subscribers.get_mut(channel) {
            entry.retain(|(_, since, tx)| {
                if revision.is_some_and(|rev| rev <= *since) {
                    return true;
                }
                match tx.try_send(payload.to_string()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
    }

    async fn resolve_kv_bucket_name(&self, pool: &PgPool, bucket_id: Uuid) -> Option<String> {
        if let Some(name) = self.kv_bucket_names.get(&bucket_id) {
            return Some(name.clone());
        }
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM kv_buckets WHERE id = $1")
            .bind(bucket_id)
            .fetch_optional(pool)
            .await
            .ok()
            .flatten();
        if let Some(name) = &name {
            self.kv_bucket_names.insert(bucket_id, name.clone());
        }
        name
    }

    async fn resolve_obj_bucket_name(&self, pool: &PgPool, bucket_id: Uuid) -> Option<String> {
        if let Some(name) = self.obj_bucket_names.get(&bucket_id) {
            return Some(name.clone());
        }
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM obj_buckets WHERE id = $1")
            .bind(bucket_id)
            .fetch_optional(pool)
            .await
            .ok()
            .flatten();
        if let Some(name) = &name {
            self.obj_bucket_names.insert(bucket_id, name.clone());
        }
        name
    }

    async fn handle_kv_notification(&self, pool: &PgPool, payload: &str) {
        let Ok(change) = serde_json::from_str::<KvChangePayload>(payload) else {
            return;
        };
        let Some(bucket_name) = self.resolve_kv_bucket_name(pool, change.bucket_id).await else {
            return;
        };
        let value = fetch_entry_value(pool, change.bucket_id, &change.key, change.revision).await;
        let event = KvWatchEvent {
            kind: change.kind,
            bucket: bucket_name,
            key: change.key.clone(),
            value,
            revision: change.revision,
            timestamp: change.timestamp,
        };
        let Ok(serialized) = serde_json::to_string(&event) else {
            return;
        };
        self.dispatch(&format!("kv:{}", change.bucket_id), &serialized, Some(change.revision));
        self.dispatch(
            &format!("kv:{}:{}", change.bucket_id, change.key),
            &serialized,
            Some(change.revision),
        );
    }

    async fn handle_obj_notification(&self, pool: &PgPool, payload: &str) {
        let Ok(change) = serde_json::from_str::<ObjChangePayload>(payload) else {
            return;
        };
        let Some(bucket_name) = self.resolve_obj_bucket_name(pool, change.bucket_id).await else {
            return;
        };
        let event = ObjectWatchEvent {
            kind: change.kind,
            bucket: bucket_name,
            name: change.name,
            size: change.size,
            digest: change.digest,
            timestamp: change.timestamp,
        };
        let Ok(serialized) = serde_json::to_string(&event) else {
            return;
        };
        self.dispatch(&format!("obj:{}", change.bucket_id), &serialized, None);
    }
}

/// Looks up the base64-encoded value a PUT notification refers to. The
/// trigger payload only carries the key and revision, not the value
/// itself -- `pg_notify` payloads are capped at 8000 bytes and values can
/// run much larger, so the fan-out task re-reads it here instead. Returns
/// `None` for tombstones (DELETE/PURGE) and for a value that's since been
/// purged out from under a slow subscriber.
async fn fetch_entry_value(pool: &PgPool, bucket_id: Uuid, key: &str, revision: i64) -> Option<String> {
    let row: Option<(Option<Vec<u8>>,)> = sqlx::query_as(
        "SELECT value FROM kv_entries WHERE bucket_id = $1 AND key = $2 AND revision = $3",
    )
    .bind(bucket_id)
    .bind(key)
    .bind(revision)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten();
    row.and_then(|(value,)| value)
        .map(|v| base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &v))
}

/// Long-running task: opens one `PgListener`, subscribes to the fixed set
/// of notify channels the migrations' triggers emit on, and forwards
/// every notification to the registry. Intended to be spawned once at
/// server startup and run for the process lifetime.
pub async fn run_listener(pool: PgPool, registry: WatchRegistry) -> CResult<()> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener
        .listen_all(["kv_changes", "obj_changes"])
        .await
        .map_err(|e| Error::Internal(format!("failed to subscribe to notify channels: {e}")))?;

    loop {
        let notification = listener.recv().await?;
        let channel = notification.channel().to_string();
        let payload = notification.payload().to_string();
        match channel.as_str() {
            "kv_changes" => registry.handle_kv_notification(&pool, &payload).await,
            "obj_changes" => registry.handle_obj_notification(&pool, &payload).await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_delivers_to_all_subscribers_of_a_channel() {
        let registry = WatchRegistry::new();
        let mut sub_a = registry.subscribe("kv:bucket-1", 0);
        let mut sub_b = registry.subscribe("kv:bucket-1", 0);
        let mut sub_other = registry.subscribe("kv:bucket-2", 0);

        registry.dispatch("kv:bucket-1", "event-payload", Some(1));

        assert_eq!(sub_a.receiver.recv().await.unwrap(), "event-payload");
        assert_eq!(sub_b.receiver.recv().await.unwrap(), "event-payload");

        registry.dispatch("kv:bucket-2", "other-payload", Some(1));
        assert_eq!(sub_other.receiver.recv().await.unwrap(), "other-payload");
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery() {
        let registry = WatchRegistry::new();
        let sub = registry.subscribe("kv:bucket-1", 0);
        assert_eq!(registry.subscriber_count("kv:bucket-1"), 1);

        registry.unsubscribe("kv:bucket-1", sub.id);
        assert_eq!(registry.subscriber_count("kv:bucket-1"), 0);
    }

    #[tokio::test]
    async fn dispatch_skips_events_already_covered_by_replay() {
        let registry = WatchRegistry::new();
        let mut sub = registry.subscribe("kv:bucket-1", 5);

        registry.dispatch("kv:bucket-1", "revision-3", Some(3));
        registry.dispatch("kv:bucket-1", "revision-6", Some(6));

        assert_eq!(sub.receiver.recv().await.unwrap(), "revision-6");
    }

    #[tokio::test]
    async fn dispatch_with_no_revision_always_delivers() {
        let registry = WatchRegistry::new();
        let mut sub = registry.subscribe("obj:bucket-1", i64::MAX);

        registry.dispatch("obj:bucket-1", "object-event", None);

        assert_eq!(sub.receiver.recv().await.unwrap(), "object-event");
    }

    #[test]
    fn kv_change_payload_deserializes_trigger_shape() {
        let payload = r#"{"type":"PUT","bucket_id":"2e5b1c2a-9b34-4b8f-8c8a-5a0b6a9f6a11","key":"k","revision":3,"timestamp":"2026-01-01T00:00:00Z"}"#;
        let change: KvChangePayload = serde_json::from_str(payload).unwrap();
        assert_eq!(change.kind, "PUT");
        assert_eq!(change.key, "k");
        assert_eq!(change.revision, 3);
    }
}
