use jobsentinel_core::config::Secret;
use jobsentinel_core::error::AppError;
use jobsentinel_core::models::{RawJobRecord, SourcePage, SourceQuery};
use jobsentinel_core::traits::SourceAdapter;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::fetcher::ReqwestFetcher;

const SEARCH_URL: &str = "https://www.reed.co.uk/api/1.0/search";

/// Reed.co.uk keyword search. Authenticates with the API key as the basic
/// auth username and an empty password.
#[derive(Clone)]
pub struct ReedAdapter {
    source_id: String,
    page_size: u32,
    api_key: Option<Secret>,
    http: ReqwestFetcher,
}

impl ReedAdapter {
    pub fn new(
        source_id: &str,
        page_size: u32,
        api_key: Option<Secret>,
        http: &ReqwestFetcher,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            page_size: page_size.clamp(1, 100),
            api_key,
            http: http.for_source(source_id),
        }
    }

    pub fn search_url(&self, query: &SourceQuery, page: u32) -> Result<Url, AppError> {
        let SourceQuery::Keywords { keywords, location } = query else {
            return Err(AppError::InvalidQuery(format!(
                "source '{}' only supports keyword search",
                self.source_id
            )));
        };
        let skip = u64::from(page.saturating_sub(1)) * u64::from(self.page_size);

        let mut url = Url::parse(SEARCH_URL).map_err(|e| AppError::ConfigError(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("keywords", &keywords.join(" "));
            if let Some(location) = location.as_deref().filter(|l| !l.trim().is_empty()) {
                pairs.append_pair("locationName", location);
            }
            pairs
                .append_pair("resultsToTake", &self.page_size.to_string())
                .append_pair("resultsToSkip", &skip.to_string());
        }
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    results: Vec<Value>,
    #[serde(default)]
    total_results: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReedJob {
    job_id: u64,
    job_title: String,
    #[serde(default)]
    employer_name: Option<String>,
    #[serde(default)]
    location_name: Option<String>,
    #[serde(default)]
    minimum_salary: Option<f64>,
    #[serde(default)]
    maximum_salary: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    job_description: Option<String>,
    #[serde(default)]
    job_url: Option<String>,
}

/// Decode a search page. Returns records plus the provider's total count.
pub fn parse_search(
    source_id: &str,
    body: Value,
) -> Result<(Vec<Result<RawJobRecord, AppError>>, u64), AppError> {
    let response: SearchResponse = serde_json::from_value(body)
        .map_err(|e| AppError::parse(source_id, format!("unexpected search shape: {e}")))?;

    let records = response
        .results
        .into_iter()
        .map(|value| {
            let job: ReedJob = serde_json::from_value(value)
                .map_err(|e| AppError::parse(source_id, format!("search result: {e}")))?;
            Ok(RawJobRecord {
                external_id: Some(job.job_id.to_string()),
                title: Some(job.job_title),
                company: job.employer_name,
                location: job.location_name,
                salary_min: job.minimum_salary,
                salary_max: job.maximum_salary,
                currency: job.currency.or_else(|| Some("GBP".to_string())),
                description: job.job_description,
                description_is_html: true,
                url: job.job_url,
                posted_at: job.date,
                ..RawJobRecord::new(source_id)
            })
        })
        .collect();

    Ok((records, response.total_results))
}

impl SourceAdapter for ReedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, AppError> {
        query.validate(page)?;
        let Some(key) = &self.api_key else {
            return Err(AppError::auth(&self.source_id, "no API key configured"));
        };
        let url = self.search_url(query, page)?;
        let body: Value = self.http.get_json(&url, Some(key)).await?;
        let (records, total) = parse_search(&self.source_id, body)?;

        let seen = u64::from(page) * u64::from(self.page_size);
        let has_more = !records.is_empty() && seen < total;
        tracing::debug!(source_id = %self.source_id, page, total, has_more, "Reed page fetched");
        Ok(SourcePage { records, has_more })
    }
}
