use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::JobPosting;
use crate::scoring::ScoreResult;

/// Outcome of one adapter within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterStatus {
    Ok,
    /// Some pages succeeded before a failure, breaker trip or timeout.
    Partial,
    SkippedCircuitOpen,
    Failed,
    AuthError,
    TimedOut,
    Cancelled,
    Disabled,
}

impl AdapterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterStatus::Ok => "ok",
            AdapterStatus::Partial => "partial",
            AdapterStatus::SkippedCircuitOpen => "skipped-circuit-open",
            AdapterStatus::Failed => "failed",
            AdapterStatus::AuthError => "auth-error",
            AdapterStatus::TimedOut => "timed-out",
            AdapterStatus::Cancelled => "cancelled",
            AdapterStatus::Disabled => "disabled",
        }
    }

    /// Whether the adapter delivered anything usable.
    pub fn is_success(&self) -> bool {
        matches!(self, AdapterStatus::Ok | AdapterStatus::Partial)
    }
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub status: AdapterStatus,
    pub records_fetched: usize,
    pub records_new: usize,
    /// Records discarded as unparseable.
    pub records_dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    pub fn new(status: AdapterStatus) -> Self {
        Self {
            status,
            records_fetched: 0,
            records_new: 0,
            records_dropped: 0,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Per-run summary, one entry per configured source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceReport>,
    pub dedup_flagged: u64,
}

impl PerRunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            sources: BTreeMap::new(),
            dedup_flagged: 0,
        }
    }

    pub fn source(&self, id: &str) -> Option<&SourceReport> {
        self.sources.get(id)
    }

    pub fn status_of(&self, id: &str) -> Option<AdapterStatus> {
        self.sources.get(id).map(|r| r.status)
    }

    pub fn total_fetched(&self) -> usize {
        self.sources.values().map(|r| r.records_fetched).sum()
    }

    pub fn total_new(&self) -> usize {
        self.sources.values().map(|r| r.records_new).sum()
    }

    /// True when at least one source was attempted and none produced data.
    pub fn all_failed(&self) -> bool {
        let mut attempted = self
            .sources
            .values()
            .filter(|r| r.status != AdapterStatus::Disabled)
            .peekable();
        attempted.peek().is_some() && attempted.all(|r| !r.status.is_success())
    }
}

/// Surfaced postings, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankedBatch {
    pub entries: Vec<RankedJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedJob {
    pub job: JobPosting,
    pub score: ScoreResult,
}

impl RankedBatch {
    /// Sort by score descending; ties go to the newer posting.
    pub fn from_scored(mut entries: Vec<RankedJob>) -> Self {
        entries.sort_by(|a, b| {
            b.score
                .total_score
                .total_cmp(&a.score.total_score)
                .then_with(|| b.job.posted_at.cmp(&a.job.posted_at))
        });
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobPosting> {
        self.entries.iter().map(|e| &e.job)
    }
}
