use std::future::Future;

use futures::Stream;
use futures::stream::{self, StreamExt};

use crate::config::{Secret, UserPreferences};
use crate::dedup::DedupEntry;
use crate::error::AppError;
use crate::models::{JobPosting, RawJobRecord, SourcePage, SourceQuery};
use crate::report::RankedBatch;

/// Fetches raw page content (HTML) from a URL.
pub trait PageFetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Converts HTML job descriptions into plain text.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// One job board or aggregator.
///
/// Adapters only translate a provider's native format into [`RawJobRecord`]s.
/// They never normalize, deduplicate or touch state shared with other
/// adapters, which keeps them swappable without touching identity logic.
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier used for dedup keys, reports and secrets lookup.
    fn source_id(&self) -> &str;

    /// Fetch one page (1-indexed) of results for `query`.
    fn fetch_page(
        &self,
        query: &SourceQuery,
        page: u32,
    ) -> impl Future<Output = Result<SourcePage, AppError>> + Send;

    /// Queries this adapter wants to run for the given preferences.
    ///
    /// Keyword-search adapters issue one search built from the preferences;
    /// scrape-by-url adapters override this with their configured pages.
    fn plan(&self, prefs: &UserPreferences) -> Vec<SourceQuery> {
        vec![SourceQuery::keywords(
            prefs.keywords.clone(),
            prefs.locations.first().cloned(),
        )]
    }

    /// Lazily walk pages of `query`, yielding records one at a time.
    ///
    /// One pass per call: the stream ends after the last page, after
    /// `max_pages`, or right after yielding a page-level error.
    fn fetch<'a>(
        &'a self,
        query: &'a SourceQuery,
        max_pages: u32,
    ) -> impl Stream<Item = Result<RawJobRecord, AppError>> + Send + 'a
    where
        Self: Sized,
    {
        stream::unfold(Some(1u32), move |next| async move {
            let page = next?;
            if page > max_pages {
                return None;
            }
            if let Err(e) = query.validate(page) {
                return Some((vec![Err(e)], None));
            }
            match self.fetch_page(query, page).await {
                Ok(result) => {
                    let next = result.has_more.then_some(page + 1);
                    Some((result.records, next))
                }
                Err(e) => Some((vec![Err(e)], None)),
            }
        })
        .flat_map(stream::iter)
    }
}

/// Optional external scoring signal (semantic matcher, scam classifier, ...).
///
/// The returned value is clamped to [-0.1, +0.1] by the scoring engine.
pub trait ScoreAdjuster: Send + Sync {
    fn score_adjustment(&self, job: &JobPosting) -> f64;
}

/// Resolves per-source credentials. Implementations must never log them.
pub trait SecretsProvider: Send + Sync {
    fn api_key(&self, source_id: &str) -> Option<Secret>;
}

/// Durable mirror of the dedup index.
pub trait DedupStore: Send + Sync {
    /// Most recently seen entries, newest first, at most `limit`.
    fn load_recent(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DedupEntry>, AppError>> + Send;

    /// Persist newly seen entries. Entries already present are ignored.
    fn record(&self, entries: &[DedupEntry]) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persistence/notification collaborator receiving surfaced jobs.
pub trait BatchSink: Send + Sync {
    /// Deliver a ranked batch. Returns how many postings were accepted.
    fn deliver(&self, batch: &RankedBatch) -> impl Future<Output = Result<usize, AppError>> + Send;
}

/// A no-op store/sink for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl DedupStore for NullStore {
    async fn load_recent(&self, _limit: usize) -> Result<Vec<DedupEntry>, AppError> {
        Ok(vec![])
    }

    async fn record(&self, _entries: &[DedupEntry]) -> Result<(), AppError> {
        Ok(())
    }
}

impl BatchSink for NullStore {
    async fn deliver(&self, batch: &RankedBatch) -> Result<usize, AppError> {
        Ok(batch.len())
    }
}
