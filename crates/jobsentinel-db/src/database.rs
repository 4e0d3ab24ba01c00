use std::time::Duration;

use jobsentinel_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::job_repository::JobRepository;
use crate::seen_repository::SeenJobRepository;

/// How long a run waits for a pooled connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// PostgreSQL handle shared by the seen-jobs store and the surfaced-jobs sink.
///
/// The schema lives in the workspace `migrations/` directory; call
/// [`Database::migrate`] (or use [`Database::open`]) before handing out
/// repositories.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("cannot reach PostgreSQL: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "PostgreSQL pool ready");
        Ok(Self { pool })
    }

    /// Connect and bring the schema up to date.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, AppError> {
        let db = Self::connect(config).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Integration tests bring their own pool from a throwaway container.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("schema migration failed: {e}")))
    }

    /// Durable side of the dedup index.
    pub fn seen_repo(&self) -> SeenJobRepository {
        SeenJobRepository::new(self.pool.clone())
    }

    /// Where `run --save` writes surfaced jobs.
    pub fn job_repo(&self) -> JobRepository {
        JobRepository::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
