//! Career pages that embed schema.org `JobPosting` JSON-LD.
//!
//! Works with any [`PageFetcher`]: plain HTTP for server-rendered pages, or
//! the headless browser (feature `browser`) for pages that render listings
//! client-side. robots.txt is always fetched over plain HTTP.

use std::collections::HashMap;
use std::sync::Arc;

use jobsentinel_core::config::UserPreferences;
use jobsentinel_core::error::AppError;
use jobsentinel_core::models::{RawJobRecord, SourcePage, SourceQuery};
use jobsentinel_core::traits::{PageFetcher, SourceAdapter};
use robotstxt::DefaultMatcher;
use scraper::{Html, Selector};
use serde_json::Value;
use tokio::sync::Mutex;
use url::Url;

use crate::fetcher::ReqwestFetcher;

#[derive(Clone)]
pub struct HtmlAdapter<F: PageFetcher> {
    source_id: String,
    urls: Vec<String>,
    fetcher: F,
    http: ReqwestFetcher,
    respect_robots: bool,
    /// robots.txt body per origin; `None` when the site has none.
    robots: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl<F: PageFetcher> HtmlAdapter<F> {
    pub fn new(source_id: &str, urls: Vec<String>, fetcher: F, http: &ReqwestFetcher) -> Self {
        Self {
            source_id: source_id.to_string(),
            urls,
            fetcher,
            http: http.for_source(source_id),
            respect_robots: true,
            robots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ignore_robots(mut self) -> Self {
        self.respect_robots = false;
        self
    }

    async fn allowed(&self, url: &Url) -> bool {
        if !self.respect_robots {
            return true;
        }
        let origin = url.origin().ascii_serialization();

        let mut cache = self.robots.lock().await;
        if !cache.contains_key(&origin) {
            let robots_url = format!("{origin}/robots.txt");
            let body = match self.http.get_text(&robots_url).await {
                Ok(body) => Some(body),
                Err(e) => {
                    tracing::debug!(source_id = %self.source_id, %robots_url, error = %e, "No usable robots.txt");
                    None
                }
            };
            cache.insert(origin.clone(), body);
        }

        match cache.get(&origin) {
            Some(Some(body)) => robots_allows(body, self.http.user_agent(), url.as_str()),
            _ => true,
        }
    }
}

/// Whether `user_agent` may fetch `url` under `robots_body`.
pub fn robots_allows(robots_body: &str, user_agent: &str, url: &str) -> bool {
    let agent = user_agent.split('/').next().unwrap_or(user_agent);
    let mut matcher = DefaultMatcher::default();
    matcher.one_agent_allowed_by_robots(robots_body, agent, url)
}

/// Pull every `JobPosting` out of the page's JSON-LD blocks.
///
/// A block that is not valid JSON, or a posting without a title, becomes a
/// per-record parse error.
pub fn extract_job_postings(
    source_id: &str,
    page_url: &str,
    html: &str,
) -> Vec<Result<RawJobRecord, AppError>> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for script in document.select(&selector) {
        let raw: String = script.text().collect();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => collect_postings(&value, &mut |posting| {
                records.push(posting_to_record(source_id, page_url, posting));
            }),
            Err(e) => records.push(Err(AppError::parse(
                source_id,
                format!("invalid JSON-LD block: {e}"),
            ))),
        }
    }
    records
}

fn collect_postings<'a>(value: &'a Value, visit: &mut impl FnMut(&'a Value)) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_postings(v, visit)),
        Value::Object(map) => {
            if is_type(value, "JobPosting") {
                visit(value);
            } else if let Some(graph) = map.get("@graph") {
                collect_postings(graph, visit);
            }
        }
        _ => {}
    }
}

fn is_type(value: &Value, wanted: &str) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => t == wanted,
        Some(Value::Array(ts)) => ts.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

fn posting_to_record(
    source_id: &str,
    page_url: &str,
    posting: &Value,
) -> Result<RawJobRecord, AppError> {
    let title = text(posting.get("title"))
        .ok_or_else(|| AppError::parse(source_id, "JobPosting without a title"))?;

    let company = match posting.get("hiringOrganization") {
        Some(org @ Value::Object(_)) => text(org.get("name")),
        other => text(other),
    };

    let remote = posting
        .get("jobLocationType")
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case("TELECOMMUTE"));

    let (salary_min, salary_max, currency) = salary(posting.get("baseSalary"));

    let external_id = match posting.get("identifier") {
        Some(id @ Value::Object(_)) => text(id.get("value")),
        other => text(other),
    };

    Ok(RawJobRecord {
        external_id,
        title: Some(title),
        company,
        location: location(posting.get("jobLocation")),
        remote,
        salary_min,
        salary_max,
        currency,
        description: text(posting.get("description")),
        description_is_html: true,
        url: text(posting.get("url")).map(|u| absolute_url(page_url, u)),
        posted_at: text(posting.get("datePosted")),
        ..RawJobRecord::new(source_id)
    })
}

/// Resolve a relative posting URL against the page it was found on. The
/// page URL itself is never used as a posting's URL: it is shared by every
/// posting on the page and would collide in the dedup index.
fn absolute_url(page_url: &str, url: String) -> String {
    Url::parse(page_url)
        .and_then(|base| base.join(&url))
        .map(String::from)
        .unwrap_or(url)
}

/// Strings and numbers as text; anything else is absent.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

fn location(value: Option<&Value>) -> Option<String> {
    let place = match value? {
        Value::Array(places) => places.first()?,
        other => other,
    };
    let address = place.get("address").unwrap_or(place);
    if let Value::String(s) = address {
        return Some(s.clone());
    }
    let country = match address.get("addressCountry") {
        Some(c @ Value::Object(_)) => text(c.get("name")),
        other => text(other),
    };
    let parts: Vec<String> = [
        text(address.get("addressLocality")),
        text(address.get("addressRegion")),
        country,
    ]
    .into_iter()
    .flatten()
    .collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

fn salary(value: Option<&Value>) -> (Option<f64>, Option<f64>, Option<String>) {
    let Some(base) = value else {
        return (None, None, None);
    };
    let currency = text(base.get("currency"));
    match base.get("value") {
        Some(v @ Value::Object(_)) => {
            let exact = number(v.get("value"));
            (
                number(v.get("minValue")).or(exact),
                number(v.get("maxValue")).or(exact),
                currency,
            )
        }
        other => {
            let exact = number(other);
            (exact, exact, currency)
        }
    }
}

impl<F: PageFetcher> SourceAdapter for HtmlAdapter<F> {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn plan(&self, _prefs: &UserPreferences) -> Vec<SourceQuery> {
        self.urls.iter().map(SourceQuery::url).collect()
    }

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, AppError> {
        query.validate(page)?;
        let SourceQuery::Url { url } = query else {
            return Err(AppError::InvalidQuery(format!(
                "source '{}' scrapes configured pages and does not search by keyword",
                self.source_id
            )));
        };
        if page > 1 {
            return Ok(SourcePage::last(Vec::new()));
        }

        let parsed = Url::parse(url).map_err(|e| AppError::InvalidQuery(e.to_string()))?;
        if !self.allowed(&parsed).await {
            return Err(AppError::HttpError(format!(
                "robots.txt disallows {url} for source '{}'",
                self.source_id
            )));
        }

        let html = self.fetcher.fetch(url).await?;
        let records = extract_job_postings(&self.source_id, url, &html);
        if records.is_empty() {
            tracing::info!(source_id = %self.source_id, %url, "No JobPosting markup found");
        }
        Ok(SourcePage::last(records))
    }
}
