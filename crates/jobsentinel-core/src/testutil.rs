//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::dedup::{DedupEntry, content_fingerprint};
use crate::error::AppError;
use crate::models::{JobPosting, RawJobRecord, SourcePage, SourceQuery};
use crate::orchestrator::{RunEvent, RunReporter};
use crate::traits::{Cleaner, DedupStore, SourceAdapter};

/// A normalized posting with a URL and fingerprint derived from its fields.
pub fn posting(source_id: &str, title: &str, company: &str) -> JobPosting {
    let description = format!("{title} at {company}");
    let slug = format!("{company}-{title}").to_lowercase().replace(' ', "-");
    JobPosting {
        id: Uuid::new_v4(),
        source_id: source_id.to_string(),
        external_id: None,
        title: title.to_string(),
        company: company.to_string(),
        location: String::new(),
        remote: false,
        salary_min: None,
        salary_max: None,
        currency: None,
        raw_fingerprint: content_fingerprint(company, title, &description).unwrap_or_default(),
        description,
        url: format!("https://{source_id}.example/jobs/{slug}"),
        posted_at: None,
        scraped_at: Utc::now(),
    }
}

/// A raw record as an adapter would emit it.
pub fn raw_record(source_id: &str, external_id: &str, title: &str, company: &str) -> RawJobRecord {
    RawJobRecord {
        external_id: Some(external_id.to_string()),
        title: Some(title.to_string()),
        company: Some(company.to_string()),
        location: Some("Berlin, Germany".to_string()),
        description: Some(format!("{title} working with Rust and tokio")),
        url: Some(format!("https://{source_id}.example/jobs/{external_id}")),
        ..RawJobRecord::new(source_id)
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Mock source that replays a queue of pages.
///
/// Each `fetch_page` call pops the next queued result. Once the queue is
/// drained it serves the `repeat` records as a single last page, or an empty
/// last page if none were set.
#[derive(Clone)]
pub struct MockAdapter {
    id: String,
    pages: Arc<Mutex<VecDeque<Result<SourcePage, AppError>>>>,
    repeat: Vec<RawJobRecord>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
}

impl MockAdapter {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            pages: Arc::new(Mutex::new(VecDeque::new())),
            repeat: Vec::new(),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_pages(self, pages: Vec<Result<SourcePage, AppError>>) -> Self {
        *self.pages.lock().unwrap() = pages.into();
        self
    }

    /// Serve the same records on every call once the queue is drained.
    pub fn with_repeat(mut self, records: Vec<RawJobRecord>) -> Self {
        self.repeat = records;
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `fetch_page` calls that reached the source.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceAdapter for MockAdapter {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch_page(&self, _query: &SourceQuery, _page: u32) -> Result<SourcePage, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.pages.lock().unwrap().pop_front();
        match next {
            Some(page) => page,
            None => Ok(SourcePage::last(
                self.repeat.iter().cloned().map(Ok).collect(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCleaner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockCleaner {
    strip: bool,
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockCleaner {
    /// Returns the input unchanged.
    pub fn passthrough() -> Self {
        Self {
            strip: false,
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Drops anything between `<` and `>`.
    pub fn strip_tags() -> Self {
        Self {
            strip: true,
            ..Self::passthrough()
        }
    }

    /// Fails the next call with `error`.
    pub fn with_error(error: AppError) -> Self {
        Self {
            strip: false,
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        if !self.strip {
            return Ok(html.to_string());
        }
        let mut out = String::with_capacity(html.len());
        let mut in_tag = false;
        for c in html.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                c if !in_tag => out.push(c),
                _ => {}
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MockDedupStore
// ---------------------------------------------------------------------------

/// In-memory dedup store with switchable failures.
#[derive(Clone, Default)]
pub struct MockDedupStore {
    entries: Arc<Mutex<Vec<DedupEntry>>>,
    fail_load: bool,
    fail_record: bool,
}

impl MockDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<DedupEntry>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
            ..Self::default()
        }
    }

    /// Every `load_recent` fails as if the file were unreadable.
    pub fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::default()
        }
    }

    pub fn failing_record() -> Self {
        Self {
            fail_record: true,
            ..Self::default()
        }
    }

    pub fn recorded(&self) -> Vec<DedupEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl DedupStore for MockDedupStore {
    async fn load_recent(&self, limit: usize) -> Result<Vec<DedupEntry>, AppError> {
        if self.fail_load {
            return Err(AppError::IoError(std::io::Error::other("disk on fire")));
        }
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn record(&self, entries: &[DedupEntry]) -> Result<(), AppError> {
        if self.fail_record {
            return Err(AppError::DatabaseError("write refused".into()));
        }
        self.entries.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short label per event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl RunReporter for MockReporter {
    fn report(&self, event: RunEvent<'_>) {
        let label = match event {
            RunEvent::Started { .. } => "started".to_string(),
            RunEvent::SourceFinished { source_id, report, .. } => {
                format!("source:{source_id}:{}", report.status)
            }
            RunEvent::Deduplicated { .. } => "deduplicated".to_string(),
            RunEvent::Scored { .. } => "scored".to_string(),
            RunEvent::Finished { .. } => "finished".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}
