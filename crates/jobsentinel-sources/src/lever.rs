use jobsentinel_core::config::UserPreferences;
use jobsentinel_core::error::AppError;
use jobsentinel_core::models::{RawJobRecord, SourcePage, SourceQuery};
use jobsentinel_core::traits::SourceAdapter;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::fetcher::ReqwestFetcher;

const API_BASE: &str = "https://api.lever.co/v0/postings";

/// Public Lever postings, paginated with `skip`/`limit`.
#[derive(Clone)]
pub struct LeverAdapter {
    source_id: String,
    company: String,
    page_size: u32,
    http: ReqwestFetcher,
}

impl LeverAdapter {
    pub fn new(source_id: &str, company: &str, page_size: u32, http: &ReqwestFetcher) -> Self {
        Self {
            source_id: source_id.to_string(),
            company: company.to_string(),
            page_size: page_size.max(1),
            http: http.for_source(source_id),
        }
    }

    fn postings_url(&self) -> String {
        format!("{API_BASE}/{}", self.company)
    }

    /// URL for a 1-indexed page.
    pub fn page_url(&self, base: &str, page: u32) -> Result<Url, AppError> {
        let skip = u64::from(page.saturating_sub(1)) * u64::from(self.page_size);
        let mut url = Url::parse(base).map_err(|e| AppError::InvalidQuery(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("mode", "json")
            .append_pair("skip", &skip.to_string())
            .append_pair("limit", &self.page_size.to_string());
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeverPosting {
    id: String,
    text: String,
    #[serde(default)]
    categories: Categories,
    #[serde(default)]
    workplace_type: Option<String>,
    #[serde(default)]
    hosted_url: Option<String>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    description_plain: Option<String>,
    #[serde(default)]
    salary_range: Option<SalaryRange>,
}

#[derive(Debug, Default, Deserialize)]
struct Categories {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SalaryRange {
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
}

/// Decode one page of postings. Returns the records and how many raw
/// entries the page held (which drives pagination).
pub fn parse_postings(
    source_id: &str,
    company: &str,
    body: &str,
) -> Result<(Vec<Result<RawJobRecord, AppError>>, usize), AppError> {
    let values: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| AppError::parse(source_id, format!("unexpected postings shape: {e}")))?;
    let count = values.len();

    let records = values
        .into_iter()
        .map(|value| {
            let p: LeverPosting = serde_json::from_value(value)
                .map_err(|e| AppError::parse(source_id, format!("posting record: {e}")))?;
            let remote = p
                .workplace_type
                .as_deref()
                .map(|w| w.eq_ignore_ascii_case("remote"));
            let (description, is_html) = match (p.description, p.description_plain) {
                (Some(html), _) if !html.trim().is_empty() => (Some(html), true),
                (_, plain) => (plain, false),
            };
            let (salary_min, salary_max, currency) = match p.salary_range {
                Some(s) => (s.min, s.max, s.currency),
                None => (None, None, None),
            };
            Ok(RawJobRecord {
                external_id: Some(p.id),
                title: Some(p.text),
                company: Some(company.to_string()),
                location: p.categories.location,
                remote,
                salary_min,
                salary_max,
                currency,
                description,
                description_is_html: is_html,
                url: p.hosted_url,
                posted_at: p.created_at.map(|ms| ms.to_string()),
                ..RawJobRecord::new(source_id)
            })
        })
        .collect();

    Ok((records, count))
}

impl SourceAdapter for LeverAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn plan(&self, _prefs: &UserPreferences) -> Vec<SourceQuery> {
        vec![SourceQuery::url(self.postings_url())]
    }

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, AppError> {
        query.validate(page)?;
        let base = match query {
            SourceQuery::Url { url } => url.clone(),
            SourceQuery::Keywords { .. } => self.postings_url(),
        };
        let url = self.page_url(&base, page)?;
        let body = self.http.get_text(url.as_str()).await?;
        let (records, count) = parse_postings(&self.source_id, &self.company, &body)?;

        let has_more = count >= self.page_size as usize;
        tracing::debug!(source_id = %self.source_id, page, count, has_more, "Lever page fetched");
        Ok(SourcePage { records, has_more })
    }
}
