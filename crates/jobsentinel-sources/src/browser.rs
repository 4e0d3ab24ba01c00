use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use jobsentinel_core::error::AppError;
use jobsentinel_core::traits::PageFetcher;

/// Renders career pages in headless Chromium before handing the DOM to the
/// HTML source. For listings that are injected client-side.
///
/// One Chromium process is shared across clones; every fetch opens and
/// closes its own tab.
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    source_id: String,
    timeout: Duration,
}

impl BrowserFetcher {
    pub async fn new(source_id: &str) -> Result<Self, AppError> {
        Self::with_timeout(source_id, Duration::from_secs(30)).await
    }

    pub async fn with_timeout(source_id: &str, timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // The snap wrapper rejects headless flags, so prefer a real binary.
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(source_id, binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::unavailable(source_id, format!("failed to launch browser: {e}")))?;

        let handler_source = source_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(source_id = %handler_source, error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            source_id: source_id.to_string(),
            timeout,
        })
    }
}

fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

impl PageFetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let source_id = self.source_id.as_str();
        let render = async {
            let page = self.browser.new_page(url).await.map_err(|e| {
                AppError::unavailable(source_id, format!("failed to navigate to {url}: {e}"))
            })?;

            page.find_element("body").await.map_err(|e| {
                AppError::unavailable(source_id, format!("page did not render body: {e}"))
            })?;

            let html = page.content().await.map_err(|e| {
                AppError::unavailable(source_id, format!("failed to read page content: {e}"))
            })?;

            if let Err(e) = page.close().await {
                tracing::debug!(source_id, error = %e, "Failed to close browser tab");
            }
            Ok::<String, AppError>(html)
        };

        tokio::time::timeout(self.timeout, render)
            .await
            .map_err(|_| AppError::Timeout(self.timeout.as_secs()))?
    }
}
