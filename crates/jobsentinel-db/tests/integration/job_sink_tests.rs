use jobsentinel_core::config::UserPreferences;
use jobsentinel_core::report::{RankedBatch, RankedJob};
use jobsentinel_core::scoring::score;
use jobsentinel_core::traits::BatchSink;
use jobsentinel_db::JobRepository;

use crate::common::{base_time, posting, setup_test_db};

fn ranked(external_id: &str, title: &str) -> RankedJob {
    let job = posting(external_id, title);
    let prefs = UserPreferences {
        keywords: vec!["rust".into()],
        ..UserPreferences::default()
    };
    let score = score(&job, &prefs, base_time(), None);
    RankedJob { job, score }
}

#[tokio::test]
async fn deliver_stores_jobs_with_scores() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let batch = RankedBatch::from_scored(vec![
        ranked("1", "Rust Engineer"),
        ranked("2", "Senior Rust Engineer"),
    ]);
    let accepted = repo.deliver(&batch).await.unwrap();
    assert_eq!(accepted, 2);

    let stored = repo.list_recent(10).await.unwrap();
    assert_eq!(stored.len(), 2);

    let original = &batch.entries[0];
    let found = stored
        .iter()
        .find(|r| r.job.id == original.job.id)
        .expect("delivered job is stored");
    assert_eq!(found.job.title, original.job.title);
    assert_eq!(found.job.salary_max, Some(110_000));
    assert_eq!(found.score.factor_breakdown, original.score.factor_breakdown);
    assert_eq!(found.score.decision, original.score.decision);
    assert_eq!(found.score.job_id, found.job.id);
}

#[tokio::test]
async fn redelivery_is_skipped() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let batch = RankedBatch::from_scored(vec![ranked("1", "Rust Engineer")]);
    assert_eq!(repo.deliver(&batch).await.unwrap(), 1);
    assert_eq!(repo.deliver(&batch).await.unwrap(), 0);

    // Same provider id under a fresh posting id is also skipped.
    let repost = RankedBatch::from_scored(vec![ranked("1", "Rust Engineer (reposted)")]);
    assert_eq!(repo.deliver(&repost).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    assert_eq!(repo.deliver(&RankedBatch::default()).await.unwrap(), 0);
    assert!(repo.list_recent(10).await.unwrap().is_empty());
}
