use kv_core::objects;
use kv_core::tenant::TenantSession;
use sqlx::PgPool;

#[sqlx::test]
async fn small_object_round_trips_through_a_single_chunk(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = objects::create_bucket(&mut session.tx, None, "photos", 1024, 1024 * 1024)
        .await
        .unwrap();

    let mut upload = objects::begin(
        &mut session.tx,
        &bucket,
        "cat.png",
        Some("image/png"),
        None,
        serde_json::json!({}),
    )
    .await
    .unwrap();
    upload.write_chunk(&mut session.tx, b"not actually a png").await.unwrap();
    let metadata = upload.finalize(&mut session.tx).await.unwrap();

    assert_eq!(metadata.size, 19);
    assert_eq!(metadata.chunk_count, 1);

    let body = objects::read_range(&mut session.tx, &bucket, "cat.png", 0, None)
        .await
        .unwrap();
    assert_eq!(body, b"not actually a png");

    let verified = objects::verify(&mut session.tx, &bucket, "cat.png").await.unwrap();
    assert!(verified);

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn multi_chunk_object_supports_ranged_reads(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = objects::create_bucket(&mut session.tx, None, "blobs", 4, 1024)
        .await
        .unwrap();

    let mut upload = objects::begin(&mut session.tx, &bucket, "blob", None, None, serde_json::json!({}))
        .await
        .unwrap();
    for chunk in [b"abcd".as_slice(), b"efgh".as_slice(), b"ij".as_slice()] {
        upload.write_chunk(&mut session.tx, chunk).await.unwrap();
    }
    let metadata = upload.finalize(&mut session.tx).await.unwrap();
    assert_eq!(metadata.size, 10);
    assert_eq!(metadata.chunk_count, 3);

    let middle = objects::read_range(&mut session.tx, &bucket, "blob", 3, Some(7))
        .await
        .unwrap();
    assert_eq!(middle, b"defg");

    let tail = objects::read_range(&mut session.tx, &bucket, "blob", 8, None)
        .await
        .unwrap();
    assert_eq!(tail, b"ij");

    session.commit().await.unwrap();
    Ok(())
}

#[sqlx::test]
async fn oversized_chunk_is_rejected_before_any_bytes_are_stored(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = objects::create_bucket(&mut session.tx, None, "blobs", 4, 1024)
        .await
        .unwrap();

    let mut upload = objects::begin(&mut session.tx, &bucket, "blob", None, None, serde_json::json!({}))
        .await
        .unwrap();
    let result = upload.write_chunk(&mut session.tx, b"way too big for a 4-byte chunk").await;
    assert!(result.is_err());
    Ok(())
}

#[sqlx::test]
async fn identical_chunks_across_objects_share_one_stored_body(pool: PgPool) -> sqlx::Result<()> {
    let mut session = TenantSession::bind(&pool, None).await.unwrap();
    let bucket = objects::create_bucket(&mut session.tx, None, "blobs", 1024, 1024 * 1024)
        .await
        .unwrap();

    for name in ["a", "b"] {
        let mut upload = objects::begin(&mut session.tx, &bucket, name, None, None, serde_json::json!({}))
            .await
            .unwrap();
        upload.write_chunk(&mut session.tx, b"shared payload").await.unwrap();
        upload.finalize(&mut session.tx).await.unwrap();
    }

    let chunk_rows: i64 = sqlx::query_scalar("SELECT count(*) FROM obj_chunks")
        .fetch_one(&mut *session.tx)
        .await
        .unwrap();
    assert_eq!(chunk_rows, 1);

    session.commit().await.unwrap();
    Ok(())
}
