//! Run pipeline: INIT → FANOUT → COLLECT → NORMALIZE → DEDUP → SCORE → DONE.
//!
//! FANOUT drives every enabled source concurrently, each behind its own
//! circuit breaker and token bucket. Everything after COLLECT runs on the
//! calling task, so the dedup index is never shared.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStats};
use crate::config::{SourceConfig, UserPreferences};
use crate::dedup::{DedupConfig, DedupIndex, corruption};
use crate::error::AppError;
use crate::models::{RawJobRecord, SourcePage};
use crate::normalize::Normalizer;
use crate::rate_limiter::TokenBucket;
use crate::report::{AdapterStatus, PerRunReport, RankedBatch, RankedJob, SourceReport};
use crate::retry::RetryPolicy;
use crate::scoring::score_with;
use crate::traits::{Cleaner, DedupStore, ScoreAdjuster, SourceAdapter};

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    Started {
        run_id: Uuid,
        sources: usize,
    },
    SourceFinished {
        run_id: Uuid,
        source_id: &'a str,
        report: &'a SourceReport,
    },
    Deduplicated {
        run_id: Uuid,
        unique: usize,
        duplicates: usize,
        flagged: u64,
    },
    Scored {
        run_id: Uuid,
        surfaced: usize,
        suppressed: usize,
    },
    Finished {
        run_id: Uuid,
        report: &'a PerRunReport,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Started { run_id, sources } => {
                tracing::info!(%run_id, sources, "Run started");
            }
            RunEvent::SourceFinished {
                run_id,
                source_id,
                report,
            } => {
                if report.status.is_success() || report.status == AdapterStatus::Disabled {
                    tracing::info!(
                        %run_id,
                        source_id,
                        status = %report.status,
                        fetched = report.records_fetched,
                        new = report.records_new,
                        dropped = report.records_dropped,
                        "Source finished"
                    );
                } else {
                    tracing::warn!(
                        %run_id,
                        source_id,
                        status = %report.status,
                        error = report.error.as_deref().unwrap_or(""),
                        "Source finished without results"
                    );
                }
            }
            RunEvent::Deduplicated {
                run_id,
                unique,
                duplicates,
                flagged,
            } => {
                tracing::info!(%run_id, unique, duplicates, flagged, "Deduplicated");
            }
            RunEvent::Scored {
                run_id,
                surfaced,
                suppressed,
            } => {
                tracing::info!(%run_id, surfaced, suppressed, "Scored");
            }
            RunEvent::Finished { run_id, report } => {
                tracing::info!(
                    %run_id,
                    fetched = report.total_fetched(),
                    new = report.total_new(),
                    "Run finished"
                );
            }
        }
    }
}

/// Orchestrator tuning shared by all sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub dedup: DedupConfig,
    pub retry: RetryPolicy,
    /// Hard stop for a whole FANOUT, in seconds. Unset means no run deadline.
    pub run_deadline_secs: Option<u64>,
}

impl OrchestratorConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline_secs = Some(deadline.as_secs());
        self
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

/// Snapshot of one source's resilience state.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterState {
    pub source_id: String,
    pub circuit: CircuitBreakerStats,
    pub tokens_available: f64,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// A source together with the state only it may touch.
struct AdapterSlot<A> {
    adapter: A,
    config: SourceConfig,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
    last_success_at: Option<DateTime<Utc>>,
}

impl<A: SourceAdapter> AdapterSlot<A> {
    fn new(config: SourceConfig, adapter: A) -> Result<Self, AppError> {
        config.validate()?;
        let limiter = TokenBucket::new(&config.id, config.rate_limit)?;
        limiter.check_request(1)?;
        let breaker = CircuitBreaker::new(&config.id, config.circuit_breaker.clone());
        Ok(Self {
            adapter,
            config,
            limiter,
            breaker,
            last_success_at: None,
        })
    }

    fn id(&self) -> &str {
        &self.config.id
    }
}

/// What one source handed back during FANOUT.
#[derive(Default)]
struct Harvest {
    records: Vec<RawJobRecord>,
    dropped: usize,
    pages: u32,
    error: Option<String>,
}

impl Harvest {
    fn absorb(&mut self, source_id: &str, page: SourcePage) {
        self.pages += 1;
        for record in page.records {
            match record {
                Ok(r) => self.records.push(r),
                Err(e) => {
                    self.dropped += 1;
                    tracing::warn!(source_id, error = %e, "Dropping unparseable record");
                }
            }
        }
    }

    fn fail(&mut self, error: &impl std::fmt::Display) {
        self.error = Some(error.to_string());
    }

    fn fail_status(&self) -> AdapterStatus {
        if self.pages > 0 {
            AdapterStatus::Partial
        } else {
            AdapterStatus::Failed
        }
    }
}

/// Output of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub batch: RankedBatch,
    pub report: PerRunReport,
}

/// Owns the sources, their resilience state, and the dedup index across runs.
pub struct Orchestrator<A, C, S>
where
    A: SourceAdapter,
    C: Cleaner,
    S: DedupStore,
{
    slots: Vec<AdapterSlot<A>>,
    normalizer: Normalizer<C>,
    index: DedupIndex,
    store: S,
    adjuster: Option<Box<dyn ScoreAdjuster>>,
    config: OrchestratorConfig,
}

impl<A, C, S> Orchestrator<A, C, S>
where
    A: SourceAdapter,
    C: Cleaner,
    S: DedupStore,
{
    pub fn new(cleaner: C, store: S, config: OrchestratorConfig) -> Self {
        Self {
            slots: Vec::new(),
            normalizer: Normalizer::new(cleaner),
            index: DedupIndex::new(config.dedup),
            store,
            adjuster: None,
            config,
        }
    }

    /// Register a source. Fails on invalid limiter/breaker settings or a
    /// duplicate id, never later at run time.
    pub fn add_source(&mut self, config: SourceConfig, adapter: A) -> Result<(), AppError> {
        if self.slots.iter().any(|s| s.id() == config.id) {
            return Err(AppError::ConfigError(format!(
                "source '{}' registered twice",
                config.id
            )));
        }
        self.slots.push(AdapterSlot::new(config, adapter)?);
        Ok(())
    }

    pub fn with_source(mut self, config: SourceConfig, adapter: A) -> Result<Self, AppError> {
        self.add_source(config, adapter)?;
        Ok(self)
    }

    pub fn with_adjuster(mut self, adjuster: impl ScoreAdjuster + 'static) -> Self {
        self.adjuster = Some(Box::new(adjuster));
        self
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.id())
    }

    pub fn breaker(&self, source_id: &str) -> Option<&CircuitBreaker> {
        self.slots
            .iter()
            .find(|s| s.id() == source_id)
            .map(|s| &s.breaker)
    }

    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    pub async fn states(&self) -> Vec<AdapterState> {
        let mut states = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            states.push(AdapterState {
                source_id: slot.config.id.clone(),
                circuit: slot.breaker.stats(),
                tokens_available: slot.limiter.available().await,
                last_success_at: slot.last_success_at,
            });
        }
        states
    }

    /// Cold start: fill the index from the durable store.
    ///
    /// A store that cannot be read is logged as corruption and the index
    /// starts empty, so every posting of the next run counts as new.
    /// Returns the number of entries loaded.
    pub async fn warm(&mut self) -> usize {
        let limit = usize::try_from(self.config.dedup.capacity).unwrap_or(usize::MAX);
        match self.store.load_recent(limit).await {
            Ok(entries) => {
                let loaded = entries.len();
                self.index = DedupIndex::warm(self.config.dedup, entries);
                tracing::info!(entries = loaded, "Dedup index warmed from store");
                loaded
            }
            Err(e) => {
                let e = corruption(e);
                tracing::error!(error = %e, "Dedup store unreadable, starting with an empty index");
                self.index = DedupIndex::new(self.config.dedup);
                0
            }
        }
    }

    /// One run with tracing output and no external cancellation.
    pub async fn run(&mut self, prefs: &UserPreferences) -> Result<RunOutcome, AppError> {
        self.run_with(prefs, &CancellationToken::new(), &TracingRunReporter)
            .await
    }

    /// One full run against a preferences snapshot.
    ///
    /// Only run-level validation errors are returned; every per-source
    /// failure ends up in the report.
    pub async fn run_with<R: RunReporter>(
        &mut self,
        prefs: &UserPreferences,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<RunOutcome, AppError> {
        prefs.validate()?;

        let mut report = PerRunReport::new(Utc::now());
        let run_id = report.run_id;
        let enabled: HashSet<&str> = prefs.enabled_sources().map(|s| s.id.as_str()).collect();
        reporter.report(RunEvent::Started {
            run_id,
            sources: self.slots.iter().filter(|s| enabled.contains(s.id())).count(),
        });

        // FANOUT / COLLECT
        let deadline = self.config.run_deadline().map(|d| Instant::now() + d);
        let policy = &self.config.retry;
        let fanout = self.slots.iter_mut().map(|slot| {
            let active = enabled.contains(slot.id());
            async move {
                let mut harvest = Harvest::default();
                if !active {
                    return (slot.config.id.clone(), harvest, AdapterStatus::Disabled);
                }
                let status = {
                    let timeout = slot.config.timeout();
                    let fetch = fetch_source(slot, prefs, policy, &mut harvest);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => AdapterStatus::Cancelled,
                        () = until(deadline) => AdapterStatus::TimedOut,
                        result = tokio::time::timeout(timeout, fetch) => {
                            result.unwrap_or(AdapterStatus::TimedOut)
                        }
                    }
                };
                match status {
                    AdapterStatus::TimedOut => {
                        harvest.fail(&AppError::Timeout(slot.config.timeout_secs));
                    }
                    AdapterStatus::Cancelled => harvest.fail(&"run cancelled"),
                    _ => {}
                }
                if status.is_success() {
                    slot.last_success_at = Some(Utc::now());
                }
                (slot.config.id.clone(), harvest, status)
            }
        });
        let collected = join_all(fanout).await;

        // NORMALIZE
        let scraped_at = Utc::now();
        let mut normalized = Vec::new();
        for (source_id, harvest, status) in collected {
            let mut source_report = SourceReport::new(status);
            source_report.records_fetched = harvest.records.len() + harvest.dropped;
            source_report.records_dropped = harvest.dropped;
            source_report.error = harvest.error;
            for raw in harvest.records {
                match self.normalizer.normalize(raw, scraped_at) {
                    Ok(posting) => normalized.push(posting),
                    Err(e) => {
                        source_report.records_dropped += 1;
                        tracing::warn!(source_id = %source_id, error = %e, "Dropping record that failed normalization");
                    }
                }
            }
            report.sources.insert(source_id, source_report);
        }

        // DEDUP
        let flagged_before = self.index.flagged();
        let mut fresh = Vec::new();
        let mut seen_entries = Vec::new();
        let mut duplicates = 0;
        for posting in normalized {
            let (verdict, entries) = self.index.check_at(&posting, scraped_at);
            if verdict.is_new {
                if let Some(r) = report.sources.get_mut(&posting.source_id) {
                    r.records_new += 1;
                }
                seen_entries.extend(entries);
                fresh.push(posting);
            } else {
                duplicates += 1;
            }
        }
        report.dedup_flagged = self.index.flagged() - flagged_before;
        if !seen_entries.is_empty()
            && let Err(e) = self.store.record(&seen_entries).await
        {
            tracing::warn!(%run_id, error = %e, "Failed to persist dedup entries");
        }
        reporter.report(RunEvent::Deduplicated {
            run_id,
            unique: fresh.len(),
            duplicates,
            flagged: report.dedup_flagged,
        });

        // SCORE
        let now = Utc::now();
        let mut surfaced = Vec::new();
        let mut suppressed = 0;
        for job in fresh {
            let score = score_with(&job, prefs, now, self.adjuster.as_deref());
            if score.surfaced() {
                surfaced.push(RankedJob { job, score });
            } else {
                suppressed += 1;
            }
        }
        let batch = RankedBatch::from_scored(surfaced);
        reporter.report(RunEvent::Scored {
            run_id,
            surfaced: batch.len(),
            suppressed,
        });

        // DONE
        report.finished_at = Utc::now();
        for (source_id, source_report) in &report.sources {
            reporter.report(RunEvent::SourceFinished {
                run_id,
                source_id,
                report: source_report,
            });
        }
        reporter.report(RunEvent::Finished {
            run_id,
            report: &report,
        });

        Ok(RunOutcome { batch, report })
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Walk every planned query of one source, page by page.
///
/// Each page goes breaker → limiter → adapter, wrapped in the retry policy.
/// Records land in `harvest` as they arrive so a timeout keeps what was
/// already fetched.
async fn fetch_source<A: SourceAdapter>(
    slot: &AdapterSlot<A>,
    prefs: &UserPreferences,
    policy: &RetryPolicy,
    harvest: &mut Harvest,
) -> AdapterStatus {
    let source_id = slot.id();
    let attempted = AtomicBool::new(false);

    for query in slot.adapter.plan(prefs) {
        if let Err(e) = query.validate(1) {
            harvest.fail(&e);
            return harvest.fail_status();
        }
        tracing::debug!(source_id, query = %query.describe(), "Fetching");

        for page in 1..=slot.config.max_pages {
            let query = &query;
            let attempted = &attempted;
            let result = policy
                .run(source_id, |_attempt| async move {
                    slot.breaker
                        .call(|| async {
                            attempted.store(true, Ordering::Relaxed);
                            slot.limiter.acquire(1).await?;
                            let result = slot.adapter.fetch_page(query, page).await;
                            if let Err(e) = &result
                                && let Some(cooldown) =
                                    e.forced_cooldown(policy.rate_limit_cooldown())
                            {
                                slot.limiter.penalize(cooldown).await;
                            }
                            result
                        })
                        .await
                })
                .await;

            match result {
                Ok(fetched) => {
                    let has_more = fetched.has_more;
                    harvest.absorb(source_id, fetched);
                    if !has_more {
                        break;
                    }
                }
                Err(e @ CircuitBreakerError::Open { .. }) => {
                    harvest.fail(&e);
                    return if harvest.pages > 0 {
                        AdapterStatus::Partial
                    } else if attempted.load(Ordering::Relaxed) {
                        AdapterStatus::Failed
                    } else {
                        AdapterStatus::SkippedCircuitOpen
                    };
                }
                Err(CircuitBreakerError::Inner(e)) if e.is_auth() => {
                    harvest.fail(&e);
                    return AdapterStatus::AuthError;
                }
                Err(CircuitBreakerError::Inner(e)) => {
                    harvest.fail(&e);
                    return harvest.fail_status();
                }
            }
        }
    }

    AdapterStatus::Ok
}
