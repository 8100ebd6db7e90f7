use std::fmt;

use url::Url;

use crate::records::{Continuation, EntityType};

/// Crawl mode the scheduler is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestMode {
    /// Breadth-first structure mapping from one root; raw link following.
    SiteMap,
    /// Driver-owned extraction from fixed entry points.
    Targeted,
}

impl fmt::Display for HarvestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarvestMode::SiteMap => write!(f, "site-map"),
            HarvestMode::Targeted => write!(f, "targeted"),
        }
    }
}

/// One unit of fetch work. Created by the scheduler (seeds) or by a
/// driver (pagination/detail links); consumed exactly once by a fetch.
///
/// A target carrying a [`Continuation`] is a detail request; the
/// continuation is the only context the detail phase gets, the listing
/// is never re-fetched to recover it.
#[derive(Debug, Clone)]
pub struct CrawlTarget {
    pub url: Url,
    pub depth: u32,
    pub parent_url: Option<Url>,
    pub mode: HarvestMode,
    pub entity_hint: Option<EntityType>,
    pub continuation: Option<Continuation>,
    pub retry_count: u32,
}

impl CrawlTarget {
    /// Seed target for Site Map mode.
    pub fn site_map_root(url: Url) -> Self {
        Self {
            url,
            depth: 0,
            parent_url: None,
            mode: HarvestMode::SiteMap,
            entity_hint: None,
            continuation: None,
            retry_count: 0,
        }
    }

    /// Seed listing target for Targeted Harvest mode.
    pub fn listing(url: Url, entity: EntityType) -> Self {
        Self {
            url,
            depth: 0,
            parent_url: None,
            mode: HarvestMode::Targeted,
            entity_hint: Some(entity),
            continuation: None,
            retry_count: 0,
        }
    }

    /// Child target in Site Map mode (a followed link).
    pub fn child(&self, url: Url) -> Self {
        Self {
            url,
            depth: self.depth + 1,
            parent_url: Some(self.url.clone()),
            mode: self.mode,
            entity_hint: self.entity_hint,
            continuation: None,
            retry_count: 0,
        }
    }

    /// Next listing page, same entity and depth lineage as the current
    /// listing.
    pub fn next_page(&self, url: Url) -> Self {
        Self {
            url,
            depth: self.depth + 1,
            parent_url: Some(self.url.clone()),
            mode: self.mode,
            entity_hint: self.entity_hint,
            continuation: None,
            retry_count: 0,
        }
    }

    /// Detail request spawned from a listing row.
    pub fn detail(&self, url: Url, continuation: Continuation) -> Self {
        Self {
            url,
            depth: self.depth + 1,
            parent_url: Some(self.url.clone()),
            mode: self.mode,
            entity_hint: Some(continuation.entity_type),
            continuation: Some(continuation),
            retry_count: 0,
        }
    }

    /// Copy re-enqueued after a retryable failure.
    pub fn retried(&self) -> Self {
        let mut copy = self.clone();
        copy.retry_count += 1;
        copy
    }

    pub fn is_detail(&self) -> bool {
        self.continuation.is_some()
    }
}
