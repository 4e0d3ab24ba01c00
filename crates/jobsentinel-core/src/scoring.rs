//! Multi-factor match scoring.
//!
//! Pure and deterministic: the same posting, preferences, clock and
//! adjustment always produce the same [`ScoreResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::UserPreferences;
use crate::models::JobPosting;
use crate::traits::ScoreAdjuster;

/// Bound on the external scorer hook, either direction.
pub const MAX_ADJUSTMENT: f64 = 0.1;

const NEUTRAL: f64 = 0.5;
const DEFAULT_FLOOR_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Surface,
    Suppress,
}

/// Why a posting was forced to zero before weighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "value", rename_all = "snake_case")]
pub enum Veto {
    BlocklistedCompany(String),
    ExcludedKeyword(String),
}

/// Per-factor scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorBreakdown {
    pub keywords: f64,
    pub salary: f64,
    pub location: f64,
    pub company: f64,
    pub recency: f64,
    /// External hook contribution after clamping.
    pub adjustment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub job_id: Uuid,
    pub total_score: f64,
    pub factor_breakdown: FactorBreakdown,
    pub decision: Decision,
    pub veto: Option<Veto>,
}

impl ScoreResult {
    pub fn surfaced(&self) -> bool {
        self.decision == Decision::Surface
    }
}

/// Score one posting.
///
/// `adjustment` is the optional external signal; it is clamped to
/// [-0.1, +0.1] and added after the weighted sum.
pub fn score(
    job: &JobPosting,
    prefs: &UserPreferences,
    now: DateTime<Utc>,
    adjustment: Option<f64>,
) -> ScoreResult {
    let factors = FactorBreakdown {
        keywords: keyword_fit(job, prefs),
        salary: salary_fit(job, prefs),
        location: location_fit(job, prefs),
        company: company_fit(job, prefs),
        recency: recency_fit(job, prefs, now),
        adjustment: adjustment
            .filter(|a| a.is_finite())
            .map(|a| a.clamp(-MAX_ADJUSTMENT, MAX_ADJUSTMENT))
            .unwrap_or(0.0),
    };

    if let Some(veto) = veto(job, prefs) {
        return ScoreResult {
            job_id: job.id,
            total_score: 0.0,
            factor_breakdown: factors,
            decision: Decision::Suppress,
            veto: Some(veto),
        };
    }

    let w = &prefs.weights;
    let weighted = w.keywords * factors.keywords
        + w.salary * factors.salary
        + w.location * factors.location
        + w.company * factors.company
        + w.recency * factors.recency;
    let total = (weighted + factors.adjustment).clamp(0.0, 1.0);

    let decision = if total >= prefs.threshold {
        Decision::Surface
    } else {
        Decision::Suppress
    };

    ScoreResult {
        job_id: job.id,
        total_score: total,
        factor_breakdown: factors,
        decision,
        veto: None,
    }
}

/// Score with an optional [`ScoreAdjuster`] hook.
pub fn score_with(
    job: &JobPosting,
    prefs: &UserPreferences,
    now: DateTime<Utc>,
    adjuster: Option<&dyn ScoreAdjuster>,
) -> ScoreResult {
    score(job, prefs, now, adjuster.map(|a| a.score_adjustment(job)))
}

fn veto(job: &JobPosting, prefs: &UserPreferences) -> Option<Veto> {
    if prefs.is_blocklisted(&job.company) {
        return Some(Veto::BlocklistedCompany(job.company.clone()));
    }
    let haystack = format!("{} {}", job.title, job.description).to_lowercase();
    prefs
        .excluded_keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .find(|k| haystack.contains(&k.to_lowercase()))
        .map(|k| Veto::ExcludedKeyword(k.to_string()))
}

/// Fraction of preferred keywords found in title + description.
pub fn keyword_fit(job: &JobPosting, prefs: &UserPreferences) -> f64 {
    let keywords: Vec<String> = prefs
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return 1.0;
    }
    let haystack = format!("{} {}", job.title, job.description).to_lowercase();
    let hits = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
    hits as f64 / keywords.len() as f64
}

/// 1.0 at or above `salary_min`, linear down to 0 at the floor.
/// Undisclosed salary is neutral (1.0), never penalized.
pub fn salary_fit(job: &JobPosting, prefs: &UserPreferences) -> f64 {
    let Some(target) = prefs.salary_min.filter(|m| *m > 0) else {
        return 1.0;
    };
    let Some(midpoint) = job.salary_midpoint() else {
        return 1.0;
    };
    let target = target as f64;
    if midpoint >= target {
        return 1.0;
    }
    let floor = prefs
        .salary_floor
        .map(|f| f as f64)
        .unwrap_or(target * DEFAULT_FLOOR_RATIO);
    if midpoint <= floor || target <= floor {
        return 0.0;
    }
    ((midpoint - floor) / (target - floor)).clamp(0.0, 1.0)
}

/// Exact or remote match 1.0, same region 0.5, unknown 0.5, mismatch 0.
pub fn location_fit(job: &JobPosting, prefs: &UserPreferences) -> f64 {
    let preferred: Vec<String> = prefs
        .locations
        .iter()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect();
    if preferred.is_empty() {
        return 1.0;
    }
    if job.remote && (prefs.allow_remote || preferred.iter().any(|l| l == "remote")) {
        return 1.0;
    }
    let location = job.location.trim().to_lowercase();
    if location.is_empty() {
        return NEUTRAL;
    }
    if preferred
        .iter()
        .any(|p| location.contains(p.as_str()) || p.contains(location.as_str()))
    {
        return 1.0;
    }
    let job_region = region_of(&location);
    if job_region.is_some() && preferred.iter().any(|p| region_of(p) == job_region) {
        return NEUTRAL;
    }
    0.0
}

/// Trailing component of a "City, Region" location.
fn region_of(location: &str) -> Option<&str> {
    let (_, region) = location.rsplit_once(',')?;
    let region = region.trim();
    (!region.is_empty()).then_some(region)
}

/// Blocklisted companies never reach this point. Allow-listed ones get full
/// credit; everyone else is neutral.
pub fn company_fit(job: &JobPosting, prefs: &UserPreferences) -> f64 {
    if prefs.is_allowlisted(&job.company) {
        1.0
    } else {
        NEUTRAL
    }
}

/// Linear decay from 1.0 when posted now to 0 at `max_age_days`.
pub fn recency_fit(job: &JobPosting, prefs: &UserPreferences, now: DateTime<Utc>) -> f64 {
    let posted = job.posted_at.unwrap_or(job.scraped_at);
    let age_days = (now - posted).num_seconds().max(0) as f64 / 86_400.0;
    let max_age = f64::from(prefs.max_age_days.max(1));
    (1.0 - age_days / max_age).clamp(0.0, 1.0)
}
