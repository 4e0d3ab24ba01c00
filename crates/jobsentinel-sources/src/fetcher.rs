use std::net::IpAddr;
use std::time::Duration;

use jobsentinel_core::config::Secret;
use jobsentinel_core::error::AppError;
use jobsentinel_core::rate_limiter::MAX_PENALTY;
use jobsentinel_core::traits::PageFetcher;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

const USER_AGENT: &str = concat!("JobSentinel/", env!("CARGO_PKG_VERSION"));

/// HTTP client shared by the API and HTML sources.
///
/// Every failure is mapped onto the source error taxonomy: 401/403 become
/// auth errors, 429 becomes a rate-limit error carrying `Retry-After`, 5xx
/// and network failures are transient. By default, SSRF protection is
/// **enabled**: requests to private/reserved IP ranges are blocked.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    source_id: String,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            source_id: "http".to_string(),
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    /// A handle that labels its errors with `source_id`. Shares the
    /// connection pool.
    pub fn for_source(&self, source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..self.clone()
        }
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn user_agent(&self) -> &'static str {
        USER_AGENT
    }

    /// GET `url` and decode the body as JSON.
    ///
    /// A body that does not decode is a parse error for the whole page.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        basic_auth: Option<&Secret>,
    ) -> Result<T, AppError> {
        let mut request = self.client.get(url.as_str());
        if let Some(key) = basic_auth {
            request = request.basic_auth(key.expose(), Some(""));
        }
        let body = self.send(url.as_str(), request).await?;
        serde_json::from_str(&body).map_err(|e| {
            AppError::parse(&self.source_id, format!("unexpected response shape: {e}"))
        })
    }

    /// GET `url` and return the body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, AppError> {
        let request = self.client.get(url);
        self.send(url, request).await
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<String, AppError> {
        if self.ssrf_protection {
            validate_url(&self.source_id, url).await?;
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else {
                AppError::unavailable(&self.source_id, format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        classify_status(&self.source_id, status, retry_after.as_deref())?;

        response.text().await.map_err(|e| {
            AppError::unavailable(&self.source_id, format!("failed to read response body: {e}"))
        })
    }
}

impl PageFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.get_text(url).await
    }
}

/// Map a non-success HTTP status onto the source error taxonomy.
pub fn classify_status(
    source_id: &str,
    status: StatusCode,
    retry_after: Option<&str>,
) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(AppError::auth(source_id, format!("HTTP {code}")))
        }
        StatusCode::TOO_MANY_REQUESTS => Err(AppError::SourceRateLimited {
            source_id: source_id.to_string(),
            retry_after: retry_after.and_then(parse_retry_after),
        }),
        StatusCode::REQUEST_TIMEOUT => Err(AppError::unavailable(source_id, format!("HTTP {code}"))),
        s if s.is_server_error() => Err(AppError::unavailable(source_id, format!("HTTP {code}"))),
        _ => Err(AppError::HttpError(format!("HTTP {code} from source '{source_id}'"))),
    }
}

/// `Retry-After` in delta-seconds form, capped at [`MAX_PENALTY`]. HTTP-date
/// values are ignored and the limiter falls back to its default cooldown.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs).min(MAX_PENALTY))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(source_id: &str, url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host(format!("{host}:{port}"))
        .await
        .map_err(|e| AppError::unavailable(source_id, format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::unavailable(
            source_id,
            format!("DNS resolution returned no addresses for {host}"),
        ));
    }

    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::HttpError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
