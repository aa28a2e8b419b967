//! Expiry Sweeper.
//!
//! Runs on a fixed interval, binding a single `kv_sweeper` (`BYPASSRLS`)
//! session that sees every tenant's buckets at once rather than
//! impersonating one tenant at a time -- see `TenantSession::bind_privileged`.

use std::time::Duration as StdDuration;

use chrono::Utc;
use log::{debug, error, info, warn};
use sqlx::PgPool;

use crate::error::CResult;
use crate::kv;
use crate::repo::kv_repo;
use crate::tenant::TenantSession;

const SWEEP_BATCH_SIZE: i64 = 500;

/// Runs forever, sweeping expired KV entries every `interval`. Intended
/// to be spawned as its own task at server startup.
pub async fn run(pool: PgPool, interval: StdDuration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(err) = sweep_once(&pool).await {
            error!("expiry sweep failed: {err}");
        }
    }
}

async fn sweep_once(pool: &PgPool) -> CResult<()> {
    let mut session = TenantSession::bind_privileged(pool).await?;
    let now = Utc::now();
    let buckets = kv::list_buckets(&mut session.tx).await?;
    let mut total_expired = 0usize;
    for bucket in buckets {
        loop {
            let keys =
                kv_repo::list_expired_keys(&mut session.tx, bucket.id, now, SWEEP_BATCH_SIZE).await?;
            if keys.is_empty() {
                break;
            }
            let batch_len = keys.len();
            for key in keys {
                match kv::delete(&mut session.tx, &bucket, &key, now).await {
                    Ok(_) => total_expired += 1,
                    Err(err) => warn!(
                        "expiry sweep failed to tombstone {}/{key}: {err}",
                        bucket.name
                    ),
                }
            }
            if batch_len < SWEEP_BATCH_SIZE as usize {
                break;
            }
        }
    }
    session.commit().await?;
    if total_expired > 0 {
        info!("expiry sweep tombstoned {total_expired} key(s)");
    } else {
        debug!("expiry sweep found nothing to tombstone");
    }
    Ok(())
}
