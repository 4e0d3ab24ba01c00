//! Config-time construction of the closed set of source adapters.

use jobsentinel_core::config::{Secret, SourceConfig, SourceSettings, UserPreferences};
use jobsentinel_core::error::AppError;
use jobsentinel_core::models::{SourcePage, SourceQuery};
use jobsentinel_core::traits::{SecretsProvider, SourceAdapter};

#[cfg(feature = "browser")]
use crate::browser::BrowserFetcher;
use crate::fetcher::ReqwestFetcher;
use crate::greenhouse::GreenhouseAdapter;
use crate::html::HtmlAdapter;
use crate::lever::LeverAdapter;
use crate::mcp::McpAdapter;
use crate::reed::ReedAdapter;

/// Every adapter the registry knows how to build.
#[derive(Clone)]
pub enum Source {
    Greenhouse(GreenhouseAdapter),
    Lever(LeverAdapter),
    Reed(ReedAdapter),
    Html(HtmlAdapter<ReqwestFetcher>),
    #[cfg(feature = "browser")]
    BrowserHtml(HtmlAdapter<BrowserFetcher>),
    Mcp(McpAdapter),
}

macro_rules! delegate {
    ($self:ident, $a:ident => $body:expr) => {
        match $self {
            Source::Greenhouse($a) => $body,
            Source::Lever($a) => $body,
            Source::Reed($a) => $body,
            Source::Html($a) => $body,
            #[cfg(feature = "browser")]
            Source::BrowserHtml($a) => $body,
            Source::Mcp($a) => $body,
        }
    };
}

impl SourceAdapter for Source {
    fn source_id(&self) -> &str {
        delegate!(self, a => a.source_id())
    }

    fn plan(&self, prefs: &UserPreferences) -> Vec<SourceQuery> {
        delegate!(self, a => a.plan(prefs))
    }

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, AppError> {
        delegate!(self, a => a.fetch_page(query, page).await)
    }
}

/// Build the adapter for one configured source.
pub async fn build_source(
    config: &SourceConfig,
    http: &ReqwestFetcher,
    secrets: &impl SecretsProvider,
) -> Result<Source, AppError> {
    config.validate()?;
    let id = config.id.as_str();

    let source = match &config.settings {
        SourceSettings::Greenhouse {
            board_token,
            company_name,
        } => Source::Greenhouse(GreenhouseAdapter::new(
            id,
            board_token,
            company_name.clone(),
            http,
        )),
        SourceSettings::Lever { company, page_size } => {
            Source::Lever(LeverAdapter::new(id, company, *page_size, http))
        }
        SourceSettings::Reed { page_size } => {
            let key = secrets.api_key(id);
            if key.is_none() {
                tracing::warn!(source_id = id, "No API key configured; every fetch will fail");
            }
            Source::Reed(ReedAdapter::new(id, *page_size, key, http))
        }
        SourceSettings::Html { urls, use_browser } => {
            build_html(id, urls.clone(), *use_browser, http).await?
        }
        SourceSettings::Mcp {
            command,
            args,
            tool,
        } => Source::Mcp(McpAdapter::new(id, command, args.clone(), tool)),
    };

    tracing::debug!(source_id = id, kind = config.settings.kind(), "Source built");
    Ok(source)
}

#[cfg(feature = "browser")]
async fn build_html(
    id: &str,
    urls: Vec<String>,
    use_browser: bool,
    http: &ReqwestFetcher,
) -> Result<Source, AppError> {
    if use_browser {
        let browser = BrowserFetcher::new(id).await?;
        return Ok(Source::BrowserHtml(HtmlAdapter::new(id, urls, browser, http)));
    }
    Ok(Source::Html(HtmlAdapter::new(
        id,
        urls,
        http.for_source(id),
        http,
    )))
}

#[cfg(not(feature = "browser"))]
async fn build_html(
    id: &str,
    urls: Vec<String>,
    use_browser: bool,
    http: &ReqwestFetcher,
) -> Result<Source, AppError> {
    if use_browser {
        return Err(AppError::ConfigError(format!(
            "source '{id}' needs a browser; rebuild with the `browser` feature"
        )));
    }
    Ok(Source::Html(HtmlAdapter::new(
        id,
        urls,
        http.for_source(id),
        http,
    )))
}

/// Build every configured source, enabled or not, so the orchestrator can
/// report disabled ones. Fails on the first invalid config.
pub async fn build_sources<'a>(
    configs: impl IntoIterator<Item = &'a SourceConfig>,
    http: &ReqwestFetcher,
    secrets: &impl SecretsProvider,
) -> Result<Vec<(SourceConfig, Source)>, AppError> {
    let mut built = Vec::new();
    for config in configs {
        let source = build_source(config, http, secrets).await?;
        built.push((config.clone(), source));
    }
    Ok(built)
}

/// Reads `JOBSENTINEL_<SOURCE_ID>_API_KEY` from the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl EnvSecrets {
    pub fn var_name(source_id: &str) -> String {
        let id: String = source_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("JOBSENTINEL_{id}_API_KEY")
    }
}

impl SecretsProvider for EnvSecrets {
    fn api_key(&self, source_id: &str) -> Option<Secret> {
        std::env::var(Self::var_name(source_id))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(Secret::new)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct MapSecrets(HashMap<String, String>);

    impl SecretsProvider for MapSecrets {
        fn api_key(&self, source_id: &str) -> Option<Secret> {
            self.0.get(source_id).map(Secret::new)
        }
    }

    fn no_secrets() -> MapSecrets {
        MapSecrets(HashMap::new())
    }

    #[test]
    fn env_var_names_are_sanitized() {
        assert_eq!(EnvSecrets::var_name("reed"), "JOBSENTINEL_REED_API_KEY");
        assert_eq!(
            EnvSecrets::var_name("reed-uk.2"),
            "JOBSENTINEL_REED_UK_2_API_KEY"
        );
    }

    #[test]
    fn unset_env_var_is_no_secret() {
        assert!(EnvSecrets.api_key("surely-not-configured-xyz").is_none());
    }

    #[tokio::test]
    async fn builds_each_kind() {
        let http = ReqwestFetcher::new().unwrap();
        let secrets = MapSecrets(HashMap::from([("reed".to_string(), "k".to_string())]));
        let configs = vec![
            SourceConfig::new(
                "gh",
                SourceSettings::Greenhouse {
                    board_token: "acme".into(),
                    company_name: None,
                },
            ),
            SourceConfig::new(
                "lever",
                SourceSettings::Lever {
                    company: "acme".into(),
                    page_size: 50,
                },
            ),
            SourceConfig::new("reed", SourceSettings::Reed { page_size: 100 }),
            SourceConfig::new(
                "careers",
                SourceSettings::Html {
                    urls: vec!["https://acme.example/careers".into()],
                    use_browser: false,
                },
            ),
            SourceConfig::new(
                "mcp",
                SourceSettings::Mcp {
                    command: "job-mcp".into(),
                    args: vec![],
                    tool: "search_jobs".into(),
                },
            ),
        ];

        let built = build_sources(&configs, &http, &secrets).await.unwrap();
        let ids: Vec<&str> = built.iter().map(|(_, s)| s.source_id()).collect();
        assert_eq!(ids, vec!["gh", "lever", "reed", "careers", "mcp"]);
        assert!(matches!(built[0].1, Source::Greenhouse(_)));
        assert!(matches!(built[3].1, Source::Html(_)));
    }

    #[tokio::test]
    async fn plan_is_delegated() {
        let http = ReqwestFetcher::new().unwrap();
        let config = SourceConfig::new(
            "gh",
            SourceSettings::Greenhouse {
                board_token: "acme".into(),
                company_name: None,
            },
        );
        let source = build_source(&config, &http, &no_secrets()).await.unwrap();
        let plan = source.plan(&UserPreferences::default());
        assert!(matches!(&plan[0], SourceQuery::Url { url } if url.contains("/boards/acme/")));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let http = ReqwestFetcher::new().unwrap();
        let config = SourceConfig::new(
            "careers",
            SourceSettings::Html {
                urls: vec![],
                use_browser: false,
            },
        );
        let err = build_source(&config, &http, &no_secrets())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[cfg(not(feature = "browser"))]
    #[tokio::test]
    async fn browser_pages_need_the_feature() {
        let http = ReqwestFetcher::new().unwrap();
        let config = SourceConfig::new(
            "spa",
            SourceSettings::Html {
                urls: vec!["https://acme.example/careers".into()],
                use_browser: true,
            },
        );
        let err = build_source(&config, &http, &no_secrets())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
