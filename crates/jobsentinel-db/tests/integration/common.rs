use chrono::{DateTime, Duration, Utc};
use jobsentinel_core::dedup::{DedupEntry, KeyTier};
use jobsentinel_core::models::{JobPosting, compute_hash};
use jobsentinel_db::Database;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use uuid::Uuid;

/// Spins up a PostgreSQL container, runs the migrations and returns a pool.
///
/// Keep the `ContainerAsync` in scope for the test duration; dropping it
/// stops the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "jobsentinel_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string =
        format!("postgresql://postgres:postgres@{host}:{port}/jobsentinel_test");

    // The server restarts once after init, so retry until it accepts us.
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    Database::from_pool(pool.clone())
        .migrate()
        .await
        .expect("Failed to run migrations");

    (pool, container)
}

pub fn entry(key: &str, tier: KeyTier, external_id: Option<&str>, age_mins: i64) -> DedupEntry {
    DedupEntry {
        identity_key: key.to_string(),
        key_tier: tier,
        source_id: "greenhouse".to_string(),
        external_id: external_id.map(str::to_string),
        first_seen_at: base_time() - Duration::minutes(age_mins),
    }
}

pub fn base_time() -> DateTime<Utc> {
    "2026-10-19T08:00:00Z".parse().unwrap()
}

pub fn posting(external_id: &str, title: &str) -> JobPosting {
    JobPosting {
        id: Uuid::new_v4(),
        source_id: "greenhouse".into(),
        external_id: Some(external_id.into()),
        title: title.into(),
        company: "Acme".into(),
        location: "Berlin, Germany".into(),
        remote: true,
        salary_min: Some(90_000),
        salary_max: Some(110_000),
        currency: Some("EUR".into()),
        description: format!("{title} working on async Rust"),
        url: format!("https://boards.greenhouse.io/acme/jobs/{external_id}"),
        posted_at: Some(base_time() - Duration::days(1)),
        scraped_at: base_time(),
        raw_fingerprint: compute_hash(&format!("acme|{title}")),
    }
}
