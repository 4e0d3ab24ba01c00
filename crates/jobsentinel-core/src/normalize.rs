use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::dedup::content_fingerprint;
use crate::error::AppError;
use crate::models::{JobPosting, RawJobRecord};
use crate::traits::Cleaner;

/// Turns raw adapter records into [`JobPosting`]s.
///
/// Runs single-threaded after fan-in. A record that cannot be normalized is
/// reported as `SourceParseError` and dropped by the caller; it never aborts
/// the batch.
#[derive(Clone)]
pub struct Normalizer<C: Cleaner> {
    cleaner: C,
}

impl<C: Cleaner> Normalizer<C> {
    pub fn new(cleaner: C) -> Self {
        Self { cleaner }
    }

    pub fn normalize(
        &self,
        raw: RawJobRecord,
        scraped_at: DateTime<Utc>,
    ) -> Result<JobPosting, AppError> {
        let title = raw
            .title
            .as_deref()
            .map(collapse_whitespace)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::parse(&raw.source_id, "record has no title"))?;

        let company = raw.company.as_deref().map(collapse_whitespace).unwrap_or_default();
        let location = raw.location.as_deref().map(collapse_whitespace).unwrap_or_default();

        let description = match raw.description.as_deref() {
            Some(d) if raw.description_is_html => {
                let text = self.cleaner.clean(d).map_err(|e| {
                    AppError::parse(&raw.source_id, format!("description cleanup failed: {e}"))
                })?;
                text.trim().to_string()
            }
            Some(d) => d.trim().to_string(),
            None => String::new(),
        };

        let remote = raw.remote.unwrap_or_else(|| {
            let loc = location.to_lowercase();
            loc.contains("remote") || title.to_lowercase().contains("remote")
        });

        let (salary_min, salary_max) = normalize_salary(raw.salary_min, raw.salary_max);

        let posted_at = raw.posted_at.as_deref().and_then(|s| {
            let parsed = parse_timestamp(s);
            if parsed.is_none() {
                tracing::debug!(source_id = %raw.source_id, value = %s, "Unparseable posted_at");
            }
            parsed
        });

        let raw_fingerprint =
            content_fingerprint(&company, &title, &description).unwrap_or_default();

        Ok(JobPosting {
            id: Uuid::new_v4(),
            source_id: raw.source_id,
            external_id: raw
                .external_id
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            title,
            company,
            location,
            remote,
            salary_min,
            salary_max,
            currency: raw
                .currency
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty()),
            description,
            url: raw.url.map(|u| u.trim().to_string()).unwrap_or_default(),
            posted_at,
            scraped_at,
            raw_fingerprint,
        })
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_salary(min: Option<f64>, max: Option<f64>) -> (Option<u64>, Option<u64>) {
    let clean = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0).map(|v| v.round() as u64);
    match (clean(min), clean(max)) {
        (Some(a), Some(b)) if a > b => (Some(b), Some(a)),
        other => other,
    }
}

/// Parse the timestamp formats seen across providers.
///
/// RFC 3339, naive ISO date-times and dates, `dd/mm/yyyy`, and unix epoch
/// seconds or milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(epoch) = s.parse::<i64>() {
        return if epoch.abs() >= 100_000_000_000 {
            Utc.timestamp_millis_opt(epoch).single()
        } else {
            Utc.timestamp_opt(epoch, 0).single()
        };
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
        }
    }
    None
}
