//! HTTP and headless-browser collaborators for the harvest engine.

pub mod browser;
pub mod fetcher;

pub use browser::ChromiumRenderer;
pub use fetcher::ReqwestFetcher;
