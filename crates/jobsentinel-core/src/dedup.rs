//! Layered identity resolution and the bounded seen-jobs index.
//!
//! A posting is identified by the first of these keys it has:
//!
//! 1. `EXTERNAL_ID`: `(source_id, external_id)`
//! 2. `NORMALIZED_URL`: URL with tracking params, fragment, case and
//!    trailing-slash noise removed
//! 3. `CONTENT_FINGERPRINT`: hash of company, title and description prefix
//!
//! Every key a posting has is checked, highest priority first, so a repost
//! under a fresh id or URL is still caught by its fingerprint.

use chrono::{DateTime, Utc};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::models::{JobPosting, compute_hash};

/// Number of description characters that feed the content fingerprint.
pub const FINGERPRINT_DESCRIPTION_CHARS: usize = 500;

/// Query parameters that only carry attribution and never identify a job.
const TRACKING_PARAMS: &[&str] = &[
    "gclid",
    "fbclid",
    "msclkid",
    "dclid",
    "yclid",
    "mc_cid",
    "mc_eid",
    "ref",
    "referrer",
    "refid",
    "src",
    "source",
    "trk",
    "trkinfo",
    "trackingid",
    "gh_src",
    "lever-source",
    "lever-origin",
    "lever-source[]",
    "_hsenc",
    "_hsmi",
    "igshid",
];

/// Which identity layer produced a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyTier {
    ExternalId,
    NormalizedUrl,
    ContentFingerprint,
}

impl KeyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyTier::ExternalId => "EXTERNAL_ID",
            KeyTier::NormalizedUrl => "NORMALIZED_URL",
            KeyTier::ContentFingerprint => "CONTENT_FINGERPRINT",
        }
    }
}

impl std::fmt::Display for KeyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXTERNAL_ID" => Ok(KeyTier::ExternalId),
            "NORMALIZED_URL" => Ok(KeyTier::NormalizedUrl),
            "CONTENT_FINGERPRINT" => Ok(KeyTier::ContentFingerprint),
            _ => Err(format!("Unknown key tier: {s}")),
        }
    }
}

/// A resolved identity. `key` is namespaced by tier so tiers never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub tier: KeyTier,
    pub key: String,
}

impl IdentityKey {
    pub fn external_id(source_id: &str, external_id: &str) -> Self {
        Self {
            tier: KeyTier::ExternalId,
            key: format!("ext:{}:{}", source_id, external_id.trim()),
        }
    }

    pub fn normalized_url(normalized: &str) -> Self {
        Self {
            tier: KeyTier::NormalizedUrl,
            key: format!("url:{normalized}"),
        }
    }

    pub fn fingerprint(hash: &str) -> Self {
        Self {
            tier: KeyTier::ContentFingerprint,
            key: format!("fp:{hash}"),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// One remembered identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub identity_key: String,
    pub key_tier: KeyTier,
    pub source_id: String,
    pub external_id: Option<String>,
    pub first_seen_at: DateTime<Utc>,
}

/// Outcome of checking one posting.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupVerdict {
    pub key: IdentityKey,
    pub is_new: bool,
    /// Input could not be keyed; counted as new and flagged for review.
    pub flagged: bool,
}

/// Strip tracking noise from a URL so reposted links compare equal.
///
/// Drops the fragment and tracking/`utm_*` params, sorts what is left,
/// lowercases host and path, and removes a trailing slash.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    let mut kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    kept.sort();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_lowercase();
    let trimmed = path.trim_end_matches('/');
    url.set_path(if trimmed.is_empty() { "/" } else { trimmed });

    let mut out = url.to_string();
    if url.path() == "/" && url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

/// SHA-256 over lowercased company, lowercased title and the first
/// [`FINGERPRINT_DESCRIPTION_CHARS`] characters of the description.
///
/// Returns `None` when there is nothing to hash.
pub fn content_fingerprint(company: &str, title: &str, description: &str) -> Option<String> {
    let company = company.trim().to_lowercase();
    let title = title.trim().to_lowercase();
    let prefix: String = description
        .trim()
        .chars()
        .take(FINGERPRINT_DESCRIPTION_CHARS)
        .collect();
    if company.is_empty() && title.is_empty() && prefix.is_empty() {
        return None;
    }
    Some(compute_hash(&format!("{company}\u{1f}{title}\u{1f}{prefix}")))
}

/// All identity keys a posting carries, highest priority first.
pub fn candidate_keys(posting: &JobPosting) -> Vec<IdentityKey> {
    let mut keys = Vec::with_capacity(3);
    if let Some(ext) = posting.external_id.as_deref().filter(|e| !e.trim().is_empty()) {
        keys.push(IdentityKey::external_id(&posting.source_id, ext));
    }
    if let Some(url) = normalize_url(&posting.url) {
        keys.push(IdentityKey::normalized_url(&url));
    }
    let fingerprint = if posting.raw_fingerprint.is_empty() {
        content_fingerprint(&posting.company, &posting.title, &posting.description)
    } else {
        Some(posting.raw_fingerprint.clone())
    };
    if let Some(fp) = fingerprint {
        keys.push(IdentityKey::fingerprint(&fp));
    }
    keys
}

/// Sizing for the in-memory index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum identity keys held. Each posting uses up to three.
    pub capacity: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { capacity: 50_000 }
    }
}

/// Bounded LRU of seen identities.
///
/// Mutated only from the single-threaded dedup phase. Eviction can only make
/// a very old repost look new again; it never hides a genuinely new job.
pub struct DedupIndex {
    cache: Cache<String, DedupEntry>,
    flagged: u64,
}

impl DedupIndex {
    pub fn new(config: DedupConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { cache, flagged: 0 }
    }

    /// Build an index pre-populated from durable entries (newest first).
    pub fn warm(config: DedupConfig, entries: Vec<DedupEntry>) -> Self {
        let index = Self::new(config);
        // Insert oldest first so the newest end up most recently used.
        for entry in entries.into_iter().rev() {
            index.cache.insert(entry.identity_key.clone(), entry);
        }
        index
    }

    /// The resolved key and whether the posting is new.
    pub fn is_new(&mut self, posting: &JobPosting) -> (IdentityKey, bool) {
        let verdict = self.check(posting);
        (verdict.key, verdict.is_new)
    }

    /// Resolve a posting's identity and remember it.
    pub fn check(&mut self, posting: &JobPosting) -> DedupVerdict {
        self.check_at(posting, Utc::now()).0
    }

    /// Like [`check`](Self::check), also returning the entries inserted so
    /// they can be mirrored to a durable store.
    pub fn check_at(
        &mut self,
        posting: &JobPosting,
        now: DateTime<Utc>,
    ) -> (DedupVerdict, Vec<DedupEntry>) {
        let keys = candidate_keys(posting);

        let Some(primary) = keys.first().cloned() else {
            self.flagged += 1;
            tracing::warn!(
                source_id = %posting.source_id,
                posting_id = %posting.id,
                "Posting has no usable identity; treating as new and flagging for review"
            );
            let verdict = DedupVerdict {
                key: IdentityKey::fingerprint(&format!("unresolved-{}", posting.id)),
                is_new: true,
                flagged: true,
            };
            return (verdict, Vec::new());
        };

        if let Some(hit) = keys.iter().find(|k| self.cache.get(&k.key).is_some()) {
            tracing::debug!(
                source_id = %posting.source_id,
                tier = %hit.tier,
                "Duplicate posting"
            );
            let verdict = DedupVerdict {
                key: hit.clone(),
                is_new: false,
                flagged: false,
            };
            return (verdict, Vec::new());
        }

        let entries: Vec<DedupEntry> = keys
            .iter()
            .map(|k| DedupEntry {
                identity_key: k.key.clone(),
                key_tier: k.tier,
                source_id: posting.source_id.clone(),
                external_id: posting.external_id.clone(),
                first_seen_at: now,
            })
            .collect();
        for entry in &entries {
            self.cache.insert(entry.identity_key.clone(), entry.clone());
        }

        let verdict = DedupVerdict {
            key: primary,
            is_new: true,
            flagged: false,
        };
        (verdict, entries)
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.cache.contains_key(&key.key)
    }

    /// Approximate number of keys held.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Postings flagged for review since creation.
    pub fn flagged(&self) -> u64 {
        self.flagged
    }
}

/// Map a store load failure to the fail-open corruption error.
pub fn corruption(err: AppError) -> AppError {
    match err {
        AppError::DedupIndexCorruption(_) => err,
        other => AppError::DedupIndexCorruption(other.to_string()),
    }
}
