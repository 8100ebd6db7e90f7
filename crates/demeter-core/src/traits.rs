use std::future::Future;

use serde::Serialize;

use crate::error::AppError;
use crate::records::{ExtractedRecord, RelationshipRecord};

/// A completed HTTP fetch. Non-success statuses are returned here rather
/// than as errors, so the scheduler can both record the status (Site Map
/// entries) and classify the failure itself.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    /// URL after redirects.
    pub final_url: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Fetches raw HTML content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<FetchResponse, AppError>> + Send;
}

/// One network request observed while rendering a page.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkRequest {
    pub method: String,
    pub url: String,
    /// CDP resource type, e.g. `XHR`, `Fetch`, `Document`, `Image`.
    pub resource_type: String,
}

impl NetworkRequest {
    /// Requests that look like undocumented API traffic.
    pub fn is_api_like(&self) -> bool {
        matches!(self.resource_type.as_str(), "XHR" | "Fetch")
    }
}

/// A rendered page: the post-JavaScript DOM plus the network requests
/// observed while rendering.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub network_requests: Vec<NetworkRequest>,
}

/// Headless-browser render collaborator.
///
/// Used in Site Map mode to surface undocumented API endpoints. Render
/// failures and timeouts are soft: the caller falls back to the plain
/// fetch and parses whatever DOM it has.
pub trait RenderClient: Send + Sync + Clone {
    fn render(&self, url: &str) -> impl Future<Output = Result<RenderedPage, AppError>> + Send;
}

/// A no-op RenderClient for render-free runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRenderer;

impl RenderClient for NullRenderer {
    async fn render(&self, _url: &str) -> Result<RenderedPage, AppError> {
        Err(AppError::RenderError("no renderer configured".to_string()))
    }
}

/// Downstream owner of harvested data.
///
/// Both operations must be idempotent under re-delivery of the same
/// natural key; the dedup filter reduces re-deliveries but does not
/// eliminate them (it fails open).
pub trait PersistenceSink: Send + Sync + Clone {
    fn upsert(
        &self,
        record: &ExtractedRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn upsert_relationship(
        &self,
        relationship: &RelationshipRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op PersistenceSink for dry runs and Site Map mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl PersistenceSink for NullSink {
    async fn upsert(&self, _record: &ExtractedRecord) -> Result<(), AppError> {
        Ok(())
    }

    async fn upsert_relationship(
        &self,
        _relationship: &RelationshipRecord,
    ) -> Result<(), AppError> {
        Ok(())
    }
}
