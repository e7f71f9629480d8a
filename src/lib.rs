pub mod cache;
pub mod cache_manager;
pub mod error;
pub mod http_fetcher;

/// Default user agent sent by [`http_fetcher::HttpFetcher`], derived from the package version.
///
/// Can be overridden at runtime through the `LINKSYNC_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
