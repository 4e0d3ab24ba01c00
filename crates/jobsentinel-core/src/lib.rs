pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod dedup_store;
pub mod error;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod rate_limiter;
pub mod report;
pub mod retry;
pub mod scoring;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{Secret, SourceConfig, SourceSettings, UserPreferences};
pub use dedup::{DedupConfig, DedupIndex, IdentityKey, KeyTier};
pub use dedup_store::FileDedupStore;
pub use error::AppError;
pub use models::{JobPosting, RawJobRecord, SourcePage, SourceQuery, compute_hash};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RunOutcome, RunReporter, TracingRunReporter,
};
pub use rate_limiter::{RateLimitConfig, TokenBucket};
pub use report::{AdapterStatus, PerRunReport, RankedBatch, SourceReport};
pub use retry::RetryPolicy;
pub use scoring::{Decision, ScoreResult};
pub use traits::{
    BatchSink, Cleaner, DedupStore, NullStore, PageFetcher, ScoreAdjuster, SecretsProvider,
    SourceAdapter,
};
