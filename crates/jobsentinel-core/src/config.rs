use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::rate_limiter::RateLimitConfig;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Relative weight of each scoring factor. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub keywords: f64,
    pub salary: f64,
    pub location: f64,
    pub company: f64,
    pub recency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            keywords: 0.40,
            salary: 0.25,
            location: 0.20,
            company: 0.10,
            recency: 0.05,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.keywords + self.salary + self.location + self.company + self.recency
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let all = [
            ("keywords", self.keywords),
            ("salary", self.salary),
            ("location", self.location),
            ("company", self.company),
            ("recency", self.recency),
        ];
        for (name, w) in all {
            if !(0.0..=1.0).contains(&w) {
                return Err(AppError::InvalidPreferences(format!(
                    "weight '{name}' must be within [0, 1], got {w}"
                )));
            }
        }
        if (self.sum() - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(AppError::InvalidPreferences(format!(
                "scoring weights must sum to 1.0, got {:.4}",
                self.sum()
            )));
        }
        Ok(())
    }
}

/// Provider-specific settings for a configured source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    /// Public Greenhouse job board.
    Greenhouse {
        board_token: String,
        #[serde(default)]
        company_name: Option<String>,
    },
    /// Public Lever postings.
    Lever {
        company: String,
        #[serde(default = "default_lever_page_size")]
        page_size: u32,
    },
    /// Reed.co.uk search API (API key required).
    Reed {
        #[serde(default = "default_reed_page_size")]
        page_size: u32,
    },
    /// Listing pages carrying schema.org JobPosting JSON-LD.
    Html {
        urls: Vec<String>,
        #[serde(default)]
        use_browser: bool,
    },
    /// MCP server exposing a job-search tool over stdio.
    Mcp {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_mcp_tool")]
        tool: String,
    },
}

fn default_lever_page_size() -> u32 {
    50
}

fn default_reed_page_size() -> u32 {
    100
}

fn default_mcp_tool() -> String {
    "search_jobs".to_string()
}

impl SourceSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSettings::Greenhouse { .. } => "greenhouse",
            SourceSettings::Lever { .. } => "lever",
            SourceSettings::Reed { .. } => "reed",
            SourceSettings::Html { .. } => "html",
            SourceSettings::Mcp { .. } => "mcp",
        }
    }

    /// Whether this source searches by keyword (and so needs keywords).
    pub fn is_keyword_search(&self) -> bool {
        matches!(
            self,
            SourceSettings::Reed { .. } | SourceSettings::Mcp { .. }
        )
    }
}

/// One configured source plus its resilience budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: SourceSettings,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Per-source timeout for a whole run, in seconds.
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    5
}

fn default_source_timeout_secs() -> u64 {
    120
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, settings: SourceSettings) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            settings,
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_pages: default_max_pages(),
            timeout_secs: default_source_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.trim().is_empty() {
            return Err(AppError::ConfigError("source id must not be empty".into()));
        }
        if self.max_pages == 0 {
            return Err(AppError::ConfigError(format!(
                "source '{}': max_pages must be at least 1",
                self.id
            )));
        }
        self.rate_limit
            .validate()
            .map_err(|e| AppError::ConfigError(format!("source '{}': {e}", self.id)))?;
        self.circuit_breaker
            .validate()
            .map_err(|e| AppError::ConfigError(format!("source '{}': {e}", self.id)))?;
        if let SourceSettings::Html { urls, .. } = &self.settings
            && urls.is_empty()
        {
            return Err(AppError::ConfigError(format!(
                "source '{}': html sources need at least one url",
                self.id
            )));
        }
        Ok(())
    }
}

/// Read-only preferences snapshot for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub keywords: Vec<String>,
    /// Any of these in title or description vetoes the posting.
    pub excluded_keywords: Vec<String>,
    pub locations: Vec<String>,
    pub allow_remote: bool,
    pub salary_min: Option<u64>,
    /// Midpoint at which salary fit reaches 0. Defaults to half of `salary_min`.
    pub salary_floor: Option<u64>,
    pub weights: ScoringWeights,
    /// Minimum total score for a posting to surface.
    pub threshold: f64,
    pub max_age_days: u32,
    pub company_blocklist: Vec<String>,
    pub company_allowlist: Vec<String>,
    pub sources: Vec<SourceConfig>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            excluded_keywords: Vec::new(),
            locations: Vec::new(),
            allow_remote: true,
            salary_min: None,
            salary_floor: None,
            weights: ScoringWeights::default(),
            threshold: 0.70,
            max_age_days: 30,
            company_blocklist: Vec::new(),
            company_allowlist: Vec::new(),
            sources: Vec::new(),
        }
    }
}

impl UserPreferences {
    /// Load and validate preferences from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!(
                "Failed to read preferences file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let prefs: UserPreferences = serde_json::from_str(raw)?;
        prefs.validate()?;
        Ok(prefs)
    }

    /// Run-level validation. Anything failing here aborts before fan-out.
    pub fn validate(&self) -> Result<(), AppError> {
        self.weights.validate()?;
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(AppError::InvalidPreferences(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.max_age_days == 0 {
            return Err(AppError::InvalidPreferences(
                "max_age_days must be at least 1".into(),
            ));
        }
        if let (Some(min), Some(floor)) = (self.salary_min, self.salary_floor)
            && floor > min
        {
            return Err(AppError::InvalidPreferences(format!(
                "salary_floor ({floor}) must not exceed salary_min ({min})"
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.id.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            if source.enabled
                && source.settings.is_keyword_search()
                && self.keywords.iter().all(|k| k.trim().is_empty())
            {
                return Err(AppError::InvalidPreferences(format!(
                    "source '{}' searches by keyword but no keywords are configured",
                    source.id
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn is_blocklisted(&self, company: &str) -> bool {
        let company = company.trim().to_lowercase();
        !company.is_empty()
            && self
                .company_blocklist
                .iter()
                .any(|b| b.trim().to_lowercase() == company)
    }

    pub fn is_allowlisted(&self, company: &str) -> bool {
        let company = company.trim().to_lowercase();
        !company.is_empty()
            && self
                .company_allowlist
                .iter()
                .any(|b| b.trim().to_lowercase() == company)
    }
}

/// A credential that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}
