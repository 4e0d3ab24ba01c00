use std::sync::Arc;

use htmd::HtmlToMarkdown;
use jobsentinel_core::error::AppError;
use jobsentinel_core::traits::Cleaner;
use scraper::Html;

/// HTML-to-Markdown cleaner for job descriptions, using htmd.
///
/// Keeps headings, lists and emphasis as Markdown so descriptions stay
/// readable in notifications, and strips non-content elements.
#[derive(Clone)]
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl HtmdCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
                "img", "form", "button",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for HtmdCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        self.converter
            .convert(html)
            .map(|md| md.trim().to_string())
            .map_err(|e| AppError::Generic(format!("HTML conversion failed: {e}")))
    }
}

/// Decode an entity-escaped HTML string (`&lt;p&gt;` → `<p>`).
///
/// Some providers double-encode descriptions; the decoded result is still
/// HTML and goes through the [`Cleaner`] during normalization.
pub fn unescape_html(escaped: &str) -> String {
    if !escaped.contains('&') {
        return escaped.to_string();
    }
    Html::parse_fragment(escaped)
        .root_element()
        .text()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_html_to_markdown() {
        let cleaner = HtmdCleaner::new();
        let md = cleaner
            .clean("<h2>About</h2><p>Build <b>fast</b> things</p>")
            .unwrap();
        assert!(md.contains("About"));
        assert!(md.contains("**fast**"));
    }

    #[test]
    fn test_strips_script_tags() {
        let cleaner = HtmdCleaner::new();
        let md = cleaner
            .clean("<p>Content</p><script>alert('xss')</script>")
            .unwrap();
        assert!(md.contains("Content"));
        assert!(!md.contains("alert"));
    }

    #[test]
    fn test_unescape_double_encoded_description() {
        let decoded = unescape_html("&lt;p&gt;Rust &amp;amp; tokio&lt;/p&gt;");
        assert_eq!(decoded, "<p>Rust &amp; tokio</p>");
        assert_eq!(unescape_html("plain"), "plain");
    }
}
