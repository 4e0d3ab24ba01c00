use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use jobsentinel_core::dedup::{DedupEntry, KeyTier};
use jobsentinel_core::error::AppError;
use jobsentinel_core::traits::DedupStore;

/// PostgreSQL-backed dedup store. One row per identity key.
#[derive(Clone)]
pub struct SeenJobRepository {
    pool: Pool<Postgres>,
}

impl SeenJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0)
    }
}

#[derive(sqlx::FromRow)]
struct SeenJobRow {
    identity_key: String,
    key_tier: String,
    source_id: String,
    external_id: Option<String>,
    first_seen_at: DateTime<Utc>,
}

impl TryFrom<SeenJobRow> for DedupEntry {
    type Error = AppError;

    fn try_from(row: SeenJobRow) -> Result<Self, Self::Error> {
        let key_tier: KeyTier = row.key_tier.parse().map_err(|e| {
            AppError::DedupIndexCorruption(format!("row '{}': {e}", row.identity_key))
        })?;
        Ok(DedupEntry {
            identity_key: row.identity_key,
            key_tier,
            source_id: row.source_id,
            external_id: row.external_id,
            first_seen_at: row.first_seen_at,
        })
    }
}

impl DedupStore for SeenJobRepository {
    async fn load_recent(&self, limit: usize) -> Result<Vec<DedupEntry>, AppError> {
        let rows = sqlx::query_as::<_, SeenJobRow>(
            r#"
            SELECT identity_key, key_tier, source_id, external_id, first_seen_at
            FROM seen_jobs
            ORDER BY first_seen_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DedupIndexCorruption(e.to_string()))?;

        rows.into_iter().map(DedupEntry::try_from).collect()
    }

    async fn record(&self, entries: &[DedupEntry]) -> Result<(), AppError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut inserted = 0u64;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO seen_jobs (identity_key, key_tier, source_id, external_id, first_seen_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&entry.identity_key)
            .bind(entry.key_tier.as_str())
            .bind(&entry.source_id)
            .bind(&entry.external_id)
            .bind(entry.first_seen_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            offered = entries.len(),
            inserted,
            "Recorded seen jobs"
        );
        Ok(())
    }
}
