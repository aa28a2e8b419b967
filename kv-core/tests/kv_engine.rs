//! Integration tests against a real Postgres instance. `sqlx::test`
//! creates a fresh, migrated database per test and tears it down after,
//! so these only run with `DATABASE_URL` pointing at a server the test
//! runner is allowed to create throwaway databases on.

use kv_core::error::Error;
use kv_core::kv;
use kv_core::tenant::TenantSession;
use sqlx::PgPool;

#[sqlx::test]
async fn put_then_get_round_trips_the_latest_value(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = kv::create_bucket(&mut session.tx, None, "config", None, 65536, 10, None)
        .await
        .unwrap();

    kv::put(&mut session.tx, &bucket, "greeting", b"hello", None, chrono::Utc::now())
        .await
        .unwrap();
    kv::put(&mut session.tx, &bucket, "greeting", b"hello again", None, chrono::Utc::now())
        .await
        .unwrap();

    let entry = kv::get(&mut session.tx, &bucket, "greeting", chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(entry.value.as_deref(), Some(b"hello again".as_slice()));
    assert_eq!(entry.revision, 2);

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn delete_leaves_a_tombstone_that_get_reports_as_not_found(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = kv::create_bucket(&mut session.tx, None, "config", None, 65536, 10, None)
        .await
        .unwrap();

    kv::put(&mut session.tx, &bucket, "k", b"v", None, chrono::Utc::now())
        .await
        .unwrap();
    kv::delete(&mut session.tx, &bucket, "k", chrono::Utc::now())
        .await
        .unwrap();

    let result = kv::get(&mut session.tx, &bucket, "k", chrono::Utc::now()).await;
    assert!(matches!(result, Err(Error::NotFound)));

    let history = kv::history(&mut session.tx, &bucket, "k", 10).await.unwrap();
    assert_eq!(history.len(), 2);

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn cas_rejects_a_stale_expected_revision(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = kv::create_bucket(&mut session.tx, None, "config", None, 65536, 10, None)
        .await
        .unwrap();

    let entry = kv::put(&mut session.tx, &bucket, "k", b"v1", None, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(entry.revision, 1);

    let stale = kv::compare_and_swap(
        &mut session.tx,
        &bucket,
        "k",
        entry.revision,
        b"v2",
        None,
        chrono::Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(stale.revision, 2);

    let conflict = kv::compare_and_swap(
        &mut session.tx,
        &bucket,
        "k",
        entry.revision,
        b"v3",
        None,
        chrono::Utc::now(),
    )
    .await;
    assert!(matches!(conflict, Err(Error::CasConflict)));

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn cas_with_expected_zero_creates_a_brand_new_key(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = kv::create_bucket(&mut session.tx, None, "config", None, 65536, 10, None)
        .await
        .unwrap();

    let entry = kv::compare_and_swap(&mut session.tx, &bucket, "fresh", 0, b"v1", None, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(entry.revision, 1);

    let conflict = kv::compare_and_swap(&mut session.tx, &bucket, "fresh", 0, b"v2", None, chrono::Utc::now())
        .await;
    assert!(matches!(conflict, Err(Error::CasConflict)));

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn history_is_trimmed_to_max_history_per_key(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = kv::create_bucket(&mut session.tx, None, "config", None, 65536, 3, None)
        .await
        .unwrap();

    for i in 0..10 {
        let value = format!("v{i}");
        kv::put(&mut session.tx, &bucket, "k", value.as_bytes(), None, chrono::Utc::now())
            .await
            .unwrap();
    }

    let history = kv::history(&mut session.tx, &bucket, "k", 100).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].value.as_deref(), Some(b"v9".as_slice()));

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn purge_removes_every_revision(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = kv::create_bucket(&mut session.tx, None, "config", None, 65536, 10, None)
        .await
        .unwrap();

    kv::put(&mut session.tx, &bucket, "k", b"v1", None, chrono::Utc::now())
        .await
        .unwrap();
    kv::put(&mut session.tx, &bucket, "k", b"v2", None, chrono::Utc::now())
        .await
        .unwrap();
    kv::purge(&mut session.tx, &bucket, "k").await.unwrap();

    let history = kv::history(&mut session.tx, &bucket, "k", 10).await.unwrap();
    assert!(history.is_empty());

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn tenants_cannot_see_each_others_buckets(pool: PgPool) -> sqlx::Result<()> {
    let mut acme_session = TenantSession::bind(&pool, Some("acme")).await.unwrap();
    kv::create_bucket(&mut acme_session.tx, Some("acme"), "secrets", None, 65536, 10, None)
        .await
        .unwrap();
    acme_session.commit().await.unwrap();

    let mut globex_session = TenantSession::bind(&pool, Some("globex")).await.unwrap();
    let result = kv::get_bucket(&mut globex_session.tx, "secrets").await;
    assert!(matches!(result, Err(Error::NotFound)));
    globex_session.commit().await.unwrap();
    Ok(())
}
