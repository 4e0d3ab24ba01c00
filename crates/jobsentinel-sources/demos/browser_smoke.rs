/// Smoke test for the headless-browser career page path.
///
/// Renders a page in Chromium and prints any JobPosting records found.
///
///   cargo run -p jobsentinel-sources --example browser_smoke --features browser -- <url>
use jobsentinel_core::traits::PageFetcher;
use jobsentinel_sources::BrowserFetcher;
use jobsentinel_sources::html::extract_job_postings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://example.com".to_string());

    let fetcher = BrowserFetcher::new("browser-smoke").await?;
    let html = fetcher.fetch(&url).await?;
    println!("Rendered {} bytes from {url}", html.len());

    for record in extract_job_postings("browser-smoke", &url, &html) {
        match record {
            Ok(r) => println!(
                "{} | {}",
                r.title.unwrap_or_default(),
                r.company.unwrap_or_default()
            ),
            Err(e) => println!("skipped: {e}"),
        }
    }
    Ok(())
}
