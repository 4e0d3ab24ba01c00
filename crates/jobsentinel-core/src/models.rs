use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// A record exactly as a source adapter produced it.
///
/// Every field except `source_id` is optional: providers drift, and deciding
/// what is usable is the normalizer's job, not the adapter's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawJobRecord {
    pub source_id: String,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub currency: Option<String>,
    pub description: Option<String>,
    /// True when `description` is HTML and must be cleaned to text.
    #[serde(default)]
    pub description_is_html: bool,
    pub url: Option<String>,
    /// Provider timestamp in whatever format the provider uses.
    pub posted_at: Option<String>,
}

impl RawJobRecord {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }
}

/// A normalized job posting. Immutable once scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: Uuid,
    pub source_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote: bool,
    pub salary_min: Option<u64>,
    pub salary_max: Option<u64>,
    pub currency: Option<String>,
    pub description: String,
    pub url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    /// SHA-256 over company, title and the description prefix.
    pub raw_fingerprint: String,
}

impl JobPosting {
    /// Salary midpoint if at least one bound is disclosed.
    pub fn salary_midpoint(&self) -> Option<f64> {
        match (self.salary_min, self.salary_max) {
            (Some(min), Some(max)) => Some((min as f64 + max as f64) / 2.0),
            (Some(v), None) | (None, Some(v)) => Some(v as f64),
            (None, None) => None,
        }
    }
}

/// What an adapter is asked to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceQuery {
    /// Search-by-keyword against a provider's search endpoint.
    Keywords {
        keywords: Vec<String>,
        location: Option<String>,
    },
    /// Scrape a specific listing page.
    Url { url: String },
}

impl SourceQuery {
    pub fn keywords(keywords: Vec<String>, location: Option<String>) -> Self {
        SourceQuery::Keywords { keywords, location }
    }

    pub fn url(url: impl Into<String>) -> Self {
        SourceQuery::Url { url: url.into() }
    }

    /// Check the query before any I/O happens.
    pub fn validate(&self, page: u32) -> Result<(), AppError> {
        if page == 0 {
            return Err(AppError::InvalidQuery("page must be >= 1".into()));
        }
        match self {
            SourceQuery::Keywords { keywords, .. } => {
                if keywords.iter().all(|k| k.trim().is_empty()) {
                    return Err(AppError::InvalidQuery(
                        "keyword search requires at least one non-empty keyword".into(),
                    ));
                }
            }
            SourceQuery::Url { url } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| AppError::InvalidQuery(format!("invalid URL '{url}': {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(AppError::InvalidQuery(format!(
                        "URL scheme '{}' is not allowed (only http/https)",
                        parsed.scheme()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            SourceQuery::Keywords { keywords, location } => match location {
                Some(loc) => format!("keywords={} location={loc}", keywords.join(",")),
                None => format!("keywords={}", keywords.join(",")),
            },
            SourceQuery::Url { url } => format!("url={url}"),
        }
    }
}

/// One page of adapter output.
///
/// Per-record parse failures ride along inline so a single bad record never
/// aborts the page.
#[derive(Debug, Default)]
pub struct SourcePage {
    pub records: Vec<Result<RawJobRecord, AppError>>,
    pub has_more: bool,
}

impl SourcePage {
    pub fn last(records: Vec<Result<RawJobRecord, AppError>>) -> Self {
        Self {
            records,
            has_more: false,
        }
    }

    pub fn more(records: Vec<Result<RawJobRecord, AppError>>) -> Self {
        Self {
            records,
            has_more: true,
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_keyword_query_requires_keywords() {
        let empty = SourceQuery::keywords(vec!["  ".into()], None);
        assert!(matches!(empty.validate(1), Err(AppError::InvalidQuery(_))));

        let ok = SourceQuery::keywords(vec!["rust".into()], Some("Berlin".into()));
        assert!(ok.validate(1).is_ok());
    }

    #[test]
    fn test_page_zero_rejected() {
        let q = SourceQuery::keywords(vec!["rust".into()], None);
        assert!(matches!(q.validate(0), Err(AppError::InvalidQuery(_))));
    }

    #[test]
    fn test_url_query_rejects_bad_scheme() {
        assert!(SourceQuery::url("https://jobs.example.com/careers").validate(1).is_ok());
        assert!(SourceQuery::url("file:///etc/passwd").validate(1).is_err());
        assert!(SourceQuery::url("not a url").validate(1).is_err());
    }

    #[test]
    fn test_salary_midpoint() {
        let mut posting = crate::testutil::posting("greenhouse", "Rust Engineer", "Acme");
        assert_eq!(posting.salary_midpoint(), None);
        posting.salary_min = Some(100_000);
        assert_eq!(posting.salary_midpoint(), Some(100_000.0));
        posting.salary_max = Some(140_000);
        assert_eq!(posting.salary_midpoint(), Some(120_000.0));
    }
}
