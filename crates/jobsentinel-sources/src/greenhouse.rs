use jobsentinel_core::config::UserPreferences;
use jobsentinel_core::error::AppError;
use jobsentinel_core::models::{RawJobRecord, SourcePage, SourceQuery};
use jobsentinel_core::traits::SourceAdapter;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::cleaner::unescape_html;
use crate::fetcher::ReqwestFetcher;

const API_BASE: &str = "https://boards-api.greenhouse.io/v1/boards";

/// Public Greenhouse job board. The board API returns every opening in one
/// response, so there is only ever one page.
#[derive(Clone)]
pub struct GreenhouseAdapter {
    source_id: String,
    board_token: String,
    company_name: Option<String>,
    http: ReqwestFetcher,
}

impl GreenhouseAdapter {
    pub fn new(
        source_id: &str,
        board_token: &str,
        company_name: Option<String>,
        http: &ReqwestFetcher,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            board_token: board_token.to_string(),
            company_name,
            http: http.for_source(source_id),
        }
    }

    pub fn board_url(&self) -> String {
        format!("{API_BASE}/{}/jobs?content=true", self.board_token)
    }
}

#[derive(Debug, Deserialize)]
struct BoardResponse {
    jobs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseJob {
    id: u64,
    title: String,
    #[serde(default)]
    location: Option<NamedField>,
    #[serde(default)]
    absolute_url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    first_published: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedField {
    name: String,
}

/// Decode a board response. Each job is decoded on its own so one drifted
/// record becomes a parse error instead of failing the page.
pub fn parse_board(
    source_id: &str,
    company_name: Option<&str>,
    body: &str,
) -> Result<Vec<Result<RawJobRecord, AppError>>, AppError> {
    let board: BoardResponse = serde_json::from_str(body)
        .map_err(|e| AppError::parse(source_id, format!("unexpected board shape: {e}")))?;

    Ok(board
        .jobs
        .into_iter()
        .map(|value| {
            let job: GreenhouseJob = serde_json::from_value(value)
                .map_err(|e| AppError::parse(source_id, format!("job record: {e}")))?;
            Ok(RawJobRecord {
                external_id: Some(job.id.to_string()),
                title: Some(job.title),
                company: job
                    .company_name
                    .or_else(|| company_name.map(str::to_string)),
                location: job.location.map(|l| l.name),
                description: job.content.map(|c| unescape_html(&c)),
                description_is_html: true,
                url: job.absolute_url,
                posted_at: job.first_published.or(job.updated_at),
                ..RawJobRecord::new(source_id)
            })
        })
        .collect())
}

impl SourceAdapter for GreenhouseAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn plan(&self, _prefs: &UserPreferences) -> Vec<SourceQuery> {
        vec![SourceQuery::url(self.board_url())]
    }

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, AppError> {
        query.validate(page)?;
        if page > 1 {
            return Ok(SourcePage::last(Vec::new()));
        }
        let url = match query {
            SourceQuery::Url { url } => url.clone(),
            SourceQuery::Keywords { .. } => self.board_url(),
        };
        let url = Url::parse(&url).map_err(|e| AppError::InvalidQuery(e.to_string()))?;
        let body = self.http.get_text(url.as_str()).await?;
        let records = parse_board(&self.source_id, self.company_name.as_deref(), &body)?;
        tracing::debug!(source_id = %self.source_id, records = records.len(), "Greenhouse board fetched");
        Ok(SourcePage::last(records))
    }
}
