use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use jobsentinel_core::error::AppError;
use jobsentinel_core::models::JobPosting;
use jobsentinel_core::report::{RankedBatch, RankedJob};
use jobsentinel_core::scoring::{Decision, FactorBreakdown, ScoreResult, Veto};
use jobsentinel_core::traits::BatchSink;

/// Sink that stores surfaced postings together with their score.
///
/// Delivery is idempotent: a posting already stored (same id, or same
/// `(source_id, external_id)`) is skipped and not counted.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recently delivered jobs, best score first within a delivery.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<RankedJob>, AppError> {
        let rows = sqlx::query_as::<_, SurfacedJobRow>(
            r#"
            SELECT id, source_id, external_id, title, company, location, remote,
                   salary_min, salary_max, currency, description, url, posted_at,
                   scraped_at, raw_fingerprint, total_score, factor_breakdown,
                   decision, veto
            FROM surfaced_jobs
            ORDER BY delivered_at DESC, total_score DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(RankedJob::try_from).collect()
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct SurfacedJobRow {
    id: Uuid,
    source_id: String,
    external_id: Option<String>,
    title: String,
    company: String,
    location: String,
    remote: bool,
    salary_min: Option<i64>,
    salary_max: Option<i64>,
    currency: Option<String>,
    description: String,
    url: String,
    posted_at: Option<DateTime<Utc>>,
    scraped_at: DateTime<Utc>,
    raw_fingerprint: String,
    total_score: f64,
    factor_breakdown: serde_json::Value,
    decision: String,
    veto: Option<serde_json::Value>,
}

impl TryFrom<SurfacedJobRow> for RankedJob {
    type Error = AppError;

    fn try_from(row: SurfacedJobRow) -> Result<Self, Self::Error> {
        let factor_breakdown: FactorBreakdown = serde_json::from_value(row.factor_breakdown)?;
        let veto: Option<Veto> = row.veto.map(serde_json::from_value).transpose()?;
        let decision = match row.decision.as_str() {
            "SURFACE" => Decision::Surface,
            "SUPPRESS" => Decision::Suppress,
            other => {
                return Err(AppError::DatabaseError(format!(
                    "unknown decision '{other}' for job {}",
                    row.id
                )));
            }
        };

        Ok(RankedJob {
            job: JobPosting {
                id: row.id,
                source_id: row.source_id,
                external_id: row.external_id,
                title: row.title,
                company: row.company,
                location: row.location,
                remote: row.remote,
                salary_min: row.salary_min.map(|v| v.max(0) as u64),
                salary_max: row.salary_max.map(|v| v.max(0) as u64),
                currency: row.currency,
                description: row.description,
                url: row.url,
                posted_at: row.posted_at,
                scraped_at: row.scraped_at,
                raw_fingerprint: row.raw_fingerprint,
            },
            score: ScoreResult {
                job_id: row.id,
                total_score: row.total_score,
                factor_breakdown,
                decision,
                veto,
            },
        })
    }
}

fn decision_str(decision: Decision) -> &'static str {
    match decision {
        Decision::Surface => "SURFACE",
        Decision::Suppress => "SUPPRESS",
    }
}

impl BatchSink for JobRepository {
    async fn deliver(&self, batch: &RankedBatch) -> Result<usize, AppError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut accepted = 0usize;
        for RankedJob { job, score } in &batch.entries {
            let breakdown = serde_json::to_value(score.factor_breakdown)?;
            let veto = score.veto.as_ref().map(serde_json::to_value).transpose()?;

            let result = sqlx::query(
                r#"
                INSERT INTO surfaced_jobs (
                    id, source_id, external_id, title, company, location, remote,
                    salary_min, salary_max, currency, description, url, posted_at,
                    scraped_at, raw_fingerprint, total_score, factor_breakdown,
                    decision, veto
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(job.id)
            .bind(&job.source_id)
            .bind(&job.external_id)
            .bind(&job.title)
            .bind(&job.company)
            .bind(&job.location)
            .bind(job.remote)
            .bind(job.salary_min.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
            .bind(job.salary_max.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
            .bind(&job.currency)
            .bind(&job.description)
            .bind(&job.url)
            .bind(job.posted_at)
            .bind(job.scraped_at)
            .bind(&job.raw_fingerprint)
            .bind(score.total_score)
            .bind(breakdown)
            .bind(decision_str(score.decision))
            .bind(veto)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            accepted += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::info!(offered = batch.len(), accepted, "Delivered ranked batch");
        Ok(accepted)
    }
}
