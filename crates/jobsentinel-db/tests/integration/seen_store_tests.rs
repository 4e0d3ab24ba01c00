use jobsentinel_core::dedup::KeyTier;
use jobsentinel_core::traits::DedupStore;
use jobsentinel_db::SeenJobRepository;

use crate::common::{entry, setup_test_db};

#[tokio::test]
async fn record_and_load_newest_first() {
    let (pool, _container) = setup_test_db().await;
    let repo = SeenJobRepository::new(pool);

    repo.record(&[
        entry("ext:greenhouse:1", KeyTier::ExternalId, Some("1"), 30),
        entry("url:https://acme.example/jobs/1", KeyTier::NormalizedUrl, Some("1"), 30),
        entry("ext:greenhouse:2", KeyTier::ExternalId, Some("2"), 5),
    ])
    .await
    .unwrap();

    let loaded = repo.load_recent(10).await.unwrap();
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded[0].identity_key, "ext:greenhouse:2");
    assert_eq!(loaded[1].key_tier, KeyTier::ExternalId);

    let limited = repo.load_recent(1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].identity_key, "ext:greenhouse:2");
}

#[tokio::test]
async fn recording_twice_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let repo = SeenJobRepository::new(pool);
    let batch = [entry("ext:greenhouse:1", KeyTier::ExternalId, Some("1"), 0)];

    repo.record(&batch).await.unwrap();
    repo.record(&batch).await.unwrap();

    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn external_id_is_unique_per_source() {
    let (pool, _container) = setup_test_db().await;
    let repo = SeenJobRepository::new(pool);

    repo.record(&[entry("ext:greenhouse:1", KeyTier::ExternalId, Some("1"), 10)])
        .await
        .unwrap();
    // Same provider id under a differently spelled key is dropped, but
    // other tiers sharing the id are kept.
    repo.record(&[
        entry("ext:greenhouse: 1", KeyTier::ExternalId, Some("1"), 0),
        entry("fp:abc", KeyTier::ContentFingerprint, Some("1"), 0),
    ])
    .await
    .unwrap();

    assert_eq!(repo.count().await.unwrap(), 2);
}

#[tokio::test]
async fn unknown_tier_is_reported_as_corruption() {
    let (pool, _container) = setup_test_db().await;
    let repo = SeenJobRepository::new(pool.clone());

    sqlx::query("ALTER TABLE seen_jobs DROP CONSTRAINT chk_seen_jobs_tier")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO seen_jobs (identity_key, key_tier, source_id) VALUES ('x', 'BOGUS', 'greenhouse')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let err = repo.load_recent(10).await.unwrap_err();
    assert!(matches!(
        err,
        jobsentinel_core::AppError::DedupIndexCorruption(_)
    ));
}
