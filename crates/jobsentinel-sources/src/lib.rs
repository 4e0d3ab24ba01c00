#[cfg(feature = "browser")]
pub mod browser;
pub mod cleaner;
pub mod fetcher;
pub mod greenhouse;
pub mod html;
pub mod lever;
pub mod mcp;
pub mod reed;
pub mod registry;

#[cfg(feature = "browser")]
pub use browser::BrowserFetcher;
pub use cleaner::HtmdCleaner;
pub use fetcher::ReqwestFetcher;
pub use greenhouse::GreenhouseAdapter;
pub use html::HtmlAdapter;
pub use lever::LeverAdapter;
pub use mcp::McpAdapter;
pub use reed::ReedAdapter;
pub use registry::{EnvSecrets, Source, build_source, build_sources};
