//! The harvest engine: a concurrent fetch scheduler with mode dispatch.
//!
//! Drives the crawl from seed targets to exhaustion under a process-wide
//! concurrency cap. Every fetch passes the resilience chain (circuit
//! breaker, then rate limiter); every produced record passes the dedup
//! filter on its way to the persistence sink. Drivers and the
//! fingerprinter are pure functions of one response plus its continuation,
//! so sibling completions interleave freely; the only ordering is causal
//! (a detail request exists only after its listing parsed).
//!
//! A fetch failure never halts the run: retryable failures are retried
//! with bounded exponential backoff, everything else is tallied and
//! dropped, and the run always ends with a summary.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, circuit_key};
use crate::dedup::{DedupConfig, DedupFilter};
use crate::drivers::{DriverRegistry, FetchedPage};
use crate::error::AppError;
use crate::fingerprint::compute_hash;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::records::{EntityType, ExtractedRecord, RelationshipRecord};
use crate::store::KeyedStore;
use crate::target::{CrawlTarget, HarvestMode};
use crate::traits::{Fetcher, PersistenceSink, RenderClient};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Process-wide cap on in-flight fetches.
    pub concurrency: usize,

    /// Maximum link depth in Site Map mode.
    pub max_depth: u32,

    /// Scheduler-level retries per target for retryable fetch failures.
    pub max_retries: u32,

    /// Bound on each network fetch.
    pub fetch_timeout: Duration,

    /// Bound on each render-collaborator call. On expiry the plain fetch
    /// body is parsed instead; the fetch is not failed.
    pub render_timeout: Duration,

    /// First retry backoff; doubles per attempt.
    pub retry_base_delay: Duration,

    /// Backoff cap.
    pub retry_max_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_depth: 3,
            max_retries: 3,
            fetch_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
        }
    }
}

/// One row of the Site Map artifact.
#[derive(Debug, Clone, Serialize)]
pub struct SiteMapEntry {
    pub url: String,
    pub url_hash: String,
    pub title: Option<String>,
    pub depth: u32,
    pub parent_url: Option<String>,
    pub status_code: u16,
    pub content_hash: String,
}

/// Admission rejection reasons, tallied in the summary. None of these is
/// auto-retried within the same pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    CircuitOpen,
    RateLimited,
    OffDomain,
    DisallowedExtension,
    AlreadyVisited,
    MaxDepth,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::CircuitOpen => "circuit-open",
            SkipReason::RateLimited => "rate-limited",
            SkipReason::OffDomain => "off-domain",
            SkipReason::DisallowedExtension => "disallowed-extension",
            SkipReason::AlreadyVisited => "already-visited",
            SkipReason::MaxDepth => "max-depth",
        }
    }
}

/// End-of-run accounting. No single bad page or record aborts a harvest,
/// so this is where problems surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub pages_fetched: u64,
    pub pages_failed: u64,
    pub retries: u64,
    pub records_extracted: u64,
    pub relationships_extracted: u64,
    pub records_deduplicated: u64,
    /// Validation drops per entity type; a rising count here usually
    /// means the site markup drifted.
    pub validation_drops: BTreeMap<String, u64>,
    pub extraction_drops: u64,
    pub sink_errors: u64,
    /// Admission rejections per reason.
    pub skipped: BTreeMap<String, u64>,
    /// Circuit keys still open when the run finished.
    pub open_circuits: Vec<String>,
    /// Per-driver counters (Targeted mode).
    pub drivers: BTreeMap<String, crate::drivers::DriverStatsSnapshot>,
}

impl RunSummary {
    fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason.as_str().to_string()).or_default() += 1;
    }

    fn validation_drop(&mut self, entity: EntityType) {
        *self
            .validation_drops
            .entry(entity.as_str().to_string())
            .or_default() += 1;
    }
}

/// Site Map mode artifact: the visited-page table plus the API endpoints
/// the render collaborator observed.
#[derive(Debug, Clone, Serialize)]
pub struct SiteMapOutcome {
    pub entries: Vec<SiteMapEntry>,
    pub api_endpoints: Vec<String>,
    pub summary: RunSummary,
}

/// Extensions that are never documents worth visiting.
const DISALLOWED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "css", "js", "mjs", "woff", "woff2", "ttf",
    "pdf", "zip", "rar", "7z", "gz", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "mp3", "mp4",
    "avi", "mov", "xml", "rss",
];

fn has_disallowed_extension(url: &Url) -> bool {
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_ascii_lowercase))
        .and_then(|last| last.rsplit_once('.').map(|(_, ext)| ext.to_string()))
        .is_some_and(|ext| DISALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

enum Admission {
    Admit,
    Skip(SkipReason),
}

/// What one worker task hands back to the scheduler loop.
enum TaskResult {
    Done(Box<TaskOutput>),
    Requeue(CrawlTarget),
}

#[derive(Default)]
struct TaskOutput {
    target: Option<CrawlTarget>,
    fetched_ok: bool,
    fetch_error: Option<AppError>,
    skip: Option<SkipReason>,
    new_targets: Vec<CrawlTarget>,
    site_map_entry: Option<SiteMapEntry>,
    api_endpoints: Vec<String>,
    records_delivered: u64,
    records_deduplicated: u64,
    relationships_delivered: u64,
    validation_drops: Vec<EntityType>,
    extraction_drops: u64,
    sink_errors: u64,
}

impl TaskOutput {
    fn for_target(target: &CrawlTarget) -> Self {
        Self {
            target: Some(target.clone()),
            ..Default::default()
        }
    }
}

/// The harvesting engine, generic over its boundary collaborators.
pub struct HarvestEngine<F, R, S, K>
where
    F: Fetcher,
    R: RenderClient,
    S: PersistenceSink,
    K: KeyedStore,
{
    fetcher: F,
    renderer: Option<R>,
    sink: S,
    registry: DriverRegistry,
    breaker: CircuitBreaker<K>,
    limiter: RateLimiter<K>,
    dedup: DedupFilter<K>,
    config: EngineConfig,
}

impl<F, R, S, K> Clone for HarvestEngine<F, R, S, K>
where
    F: Fetcher,
    R: RenderClient,
    S: PersistenceSink,
    K: KeyedStore,
{
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            renderer: self.renderer.clone(),
            sink: self.sink.clone(),
            registry: self.registry.clone(),
            breaker: self.breaker.clone(),
            limiter: self.limiter.clone(),
            dedup: self.dedup.clone(),
            config: self.config.clone(),
        }
    }
}

impl<F, R, S, K> HarvestEngine<F, R, S, K>
where
    F: Fetcher + 'static,
    R: RenderClient + 'static,
    S: PersistenceSink + 'static,
    K: KeyedStore + 'static,
{
    /// Build an engine sharing one keyed store across the middleware
    /// chain.
    pub fn new(
        fetcher: F,
        sink: S,
        registry: DriverRegistry,
        store: K,
        config: EngineConfig,
    ) -> Self {
        Self::with_middleware(
            fetcher,
            sink,
            registry,
            CircuitBreaker::new(store.clone(), CircuitBreakerConfig::default()),
            RateLimiter::new(store.clone(), RateLimitConfig::default()),
            DedupFilter::new(store, DedupConfig::default()),
            config,
        )
    }

    /// Build an engine with explicitly configured middleware.
    pub fn with_middleware(
        fetcher: F,
        sink: S,
        registry: DriverRegistry,
        breaker: CircuitBreaker<K>,
        limiter: RateLimiter<K>,
        dedup: DedupFilter<K>,
        config: EngineConfig,
    ) -> Self {
        Self {
            fetcher,
            renderer: None,
            sink,
            registry,
            breaker,
            limiter,
            dedup,
            config,
        }
    }

    /// Attach a headless render collaborator (used in Site Map mode).
    pub fn with_renderer(mut self, renderer: R) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Targeted Harvest mode: seed from every registered driver's entry
    /// points, stream records into the sink, return the summary.
    pub async fn run_targeted(&self, cancel: CancellationToken) -> RunSummary {
        let seeds: VecDeque<CrawlTarget> = self
            .registry
            .iter()
            .flat_map(|driver| {
                let entity = driver.entity_type();
                driver
                    .start_urls()
                    .into_iter()
                    .map(move |url| CrawlTarget::listing(url, entity))
            })
            .collect();

        tracing::info!(seeds = seeds.len(), "Starting targeted harvest");
        let (mut summary, _, _) = self.run_queue(seeds, None, cancel).await;

        for driver in self.registry.iter() {
            summary
                .drivers
                .insert(driver.entity_type().as_str().to_string(), driver.stats());
        }
        summary
    }

    /// Site Map mode: breadth-first from one root, in-domain only, up to
    /// `max_depth`.
    pub async fn run_site_map(&self, root: Url, cancel: CancellationToken) -> SiteMapOutcome {
        let root_host = root.host_str().map(str::to_string);
        let seeds = VecDeque::from([CrawlTarget::site_map_root(root)]);

        tracing::info!(host = root_host.as_deref().unwrap_or("?"), "Starting site map crawl");
        let (summary, entries, api_endpoints) = self.run_queue(seeds, root_host, cancel).await;

        SiteMapOutcome {
            entries,
            api_endpoints,
            summary,
        }
    }

    /// The scheduler loop: admit targets under the concurrency cap, apply
    /// completions, retry retryable fetch failures with backoff, drain on
    /// cancellation.
    async fn run_queue(
        &self,
        mut queue: VecDeque<CrawlTarget>,
        root_host: Option<String>,
        cancel: CancellationToken,
    ) -> (RunSummary, Vec<SiteMapEntry>, Vec<String>) {
        let mut summary = RunSummary::default();
        let mut entries: Vec<SiteMapEntry> = Vec::new();
        let mut api_endpoints: BTreeSet<String> = BTreeSet::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut in_flight: JoinSet<TaskResult> = JoinSet::new();

        loop {
            while in_flight.len() < self.config.concurrency && !cancel.is_cancelled() {
                let Some(target) = queue.pop_front() else { break };
                match self.admit(&target, root_host.as_deref(), &mut visited) {
                    Admission::Admit => {
                        let engine = self.clone();
                        in_flight.spawn(async move { engine.process_target(target).await });
                    }
                    Admission::Skip(reason) => {
                        tracing::debug!(url = %target.url, reason = reason.as_str(), "Target skipped");
                        summary.skip(reason);
                    }
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                // Nothing in flight: the queue is drained or admission
                // stopped on cancellation.
                break;
            };

            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "Worker task panicked");
                    continue;
                }
            };

            match result {
                TaskResult::Requeue(target) => queue.push_back(target),
                TaskResult::Done(output) => {
                    self.apply_output(
                        *output,
                        &mut queue,
                        &mut summary,
                        &mut entries,
                        &mut api_endpoints,
                        &mut in_flight,
                        &cancel,
                    );
                }
            }
        }

        summary.open_circuits = self
            .breaker
            .open_circuits()
            .await
            .into_iter()
            .map(|stats| stats.key)
            .collect();

        tracing::info!(
            pages_fetched = summary.pages_fetched,
            pages_failed = summary.pages_failed,
            records = summary.records_extracted,
            open_circuits = summary.open_circuits.len(),
            "Run complete"
        );

        (summary, entries, api_endpoints.into_iter().collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_output(
        &self,
        output: TaskOutput,
        queue: &mut VecDeque<CrawlTarget>,
        summary: &mut RunSummary,
        entries: &mut Vec<SiteMapEntry>,
        api_endpoints: &mut BTreeSet<String>,
        in_flight: &mut JoinSet<TaskResult>,
        cancel: &CancellationToken,
    ) {
        if let Some(reason) = output.skip {
            summary.skip(reason);
            return;
        }

        if output.fetched_ok {
            summary.pages_fetched += 1;
        }
        summary.records_extracted += output.records_delivered;
        summary.records_deduplicated += output.records_deduplicated;
        summary.relationships_extracted += output.relationships_delivered;
        summary.extraction_drops += output.extraction_drops;
        summary.sink_errors += output.sink_errors;
        for entity in output.validation_drops {
            summary.validation_drop(entity);
        }
        if let Some(entry) = output.site_map_entry {
            entries.push(entry);
        }
        api_endpoints.extend(output.api_endpoints);

        for target in output.new_targets {
            queue.push_back(target);
        }

        if let Some(error) = output.fetch_error {
            summary.pages_failed += 1;
            let Some(target) = output.target else { return };
            if error.is_retryable()
                && target.retry_count < self.config.max_retries
                && !cancel.is_cancelled()
            {
                let delay = self.backoff(target.retry_count);
                tracing::warn!(
                    url = %target.url,
                    attempt = target.retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying fetch after backoff"
                );
                summary.retries += 1;
                let retried = target.retried();
                in_flight.spawn(async move {
                    tokio::time::sleep(delay).await;
                    TaskResult::Requeue(retried)
                });
            } else {
                tracing::warn!(url = %target.url, error = %error, "Dropping target");
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.config.retry_max_delay)
    }

    /// Pre-spawn admission. Only Site Map mode filters URLs; Targeted
    /// mode targets come from drivers and are always admitted.
    fn admit(
        &self,
        target: &CrawlTarget,
        root_host: Option<&str>,
        visited: &mut HashSet<String>,
    ) -> Admission {
        if target.mode != HarvestMode::SiteMap {
            return Admission::Admit;
        }
        if target.depth > self.config.max_depth {
            return Admission::Skip(SkipReason::MaxDepth);
        }
        if let Some(root) = root_host
            && target.url.host_str() != Some(root)
        {
            return Admission::Skip(SkipReason::OffDomain);
        }
        if has_disallowed_extension(&target.url) {
            return Admission::Skip(SkipReason::DisallowedExtension);
        }
        // Exact-URL repeat filter; a retried target already holds its slot.
        if target.retry_count == 0 && !visited.insert(target.url.as_str().to_string()) {
            return Admission::Skip(SkipReason::AlreadyVisited);
        }
        Admission::Admit
    }

    /// One worker: resilience chain, fetch, mode dispatch, delivery.
    async fn process_target(self, target: CrawlTarget) -> TaskResult {
        let mut output = TaskOutput::for_target(&target);
        let key = circuit_key(&target.url);

        if let Err(e) = self.breaker.preflight(&key).await {
            tracing::debug!(url = %target.url, error = %e, "Rejected by circuit breaker");
            output.skip = Some(SkipReason::CircuitOpen);
            return TaskResult::Done(Box::new(output));
        }

        if let Err(e) = self.limiter.try_admit(&target.url).await {
            tracing::debug!(url = %target.url, error = %e, "Rejected by rate limiter");
            output.skip = Some(SkipReason::RateLimited);
            return TaskResult::Done(Box::new(output));
        }

        let response = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.fetch(target.url.as_str()),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                if error.should_trip_circuit() {
                    self.breaker.record_failure(&key).await;
                }
                output.fetch_error = Some(error);
                return TaskResult::Done(Box::new(output));
            }
            Err(_) => {
                let error = AppError::Timeout(self.config.fetch_timeout.as_secs());
                self.breaker.record_failure(&key).await;
                output.fetch_error = Some(error);
                return TaskResult::Done(Box::new(output));
            }
        };

        if !response.is_success() {
            let error = AppError::HttpStatus {
                status: response.status,
                url: target.url.to_string(),
            };
            if error.should_trip_circuit() {
                self.breaker.record_failure(&key).await;
            }
            if target.mode == HarvestMode::SiteMap {
                // The structure map still records error pages.
                output.site_map_entry = Some(site_map_entry(&target, response.status, None, ""));
            }
            output.fetch_error = Some(error);
            return TaskResult::Done(Box::new(output));
        }

        self.breaker.record_success(&key).await;
        output.fetched_ok = true;

        match target.mode {
            HarvestMode::SiteMap => {
                self.process_site_map_page(&target, response.status, response.body, &mut output)
                    .await;
            }
            HarvestMode::Targeted => {
                self.process_targeted_page(&target, response.status, response.body, &mut output)
                    .await;
            }
        }

        TaskResult::Done(Box::new(output))
    }

    async fn process_site_map_page(
        &self,
        target: &CrawlTarget,
        status: u16,
        fetched_body: String,
        output: &mut TaskOutput,
    ) {
        // Prefer the rendered DOM when a collaborator is available; its
        // network trace is how undocumented API endpoints surface. On
        // timeout or error, parse the plain fetch instead.
        let body = match &self.renderer {
            Some(renderer) => {
                match tokio::time::timeout(
                    self.config.render_timeout,
                    renderer.render(target.url.as_str()),
                )
                .await
                {
                    Ok(Ok(rendered)) => {
                        output.api_endpoints = rendered
                            .network_requests
                            .iter()
                            .filter(|req| req.is_api_like())
                            .map(|req| format!("{} {}", req.method, req.url))
                            .collect();
                        rendered.html
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(url = %target.url, error = %e, "Render failed, using plain fetch");
                        fetched_body
                    }
                    Err(_) => {
                        tracing::warn!(url = %target.url, "Render timed out, using plain fetch");
                        fetched_body
                    }
                }
            }
            None => fetched_body,
        };

        let (title, links) = parse_page_links(&body, &target.url);
        output.site_map_entry = Some(site_map_entry(target, status, title, &body));

        if target.depth < self.config.max_depth {
            output.new_targets = links.into_iter().map(|link| target.child(link)).collect();
        }
    }

    async fn process_targeted_page(
        &self,
        target: &CrawlTarget,
        status: u16,
        body: String,
        output: &mut TaskOutput,
    ) {
        let Some(entity) = target.entity_hint else {
            tracing::error!(url = %target.url, "Targeted page without entity hint");
            output.extraction_drops += 1;
            return;
        };
        let Some(driver) = self.registry.get(entity) else {
            tracing::error!(entity = %entity, "No driver registered");
            output.extraction_drops += 1;
            return;
        };

        let page = FetchedPage {
            url: target.url.clone(),
            status,
            body,
        };

        // Parsing is synchronous; the parsed DOM never crosses an await.
        if let Some(continuation) = &target.continuation {
            match driver.parse_detail(&page, continuation) {
                Ok(outcome) => {
                    self.deliver(outcome.record, output).await;
                    for nested in outcome.nested_records {
                        self.deliver(nested, output).await;
                    }
                    for relationship in outcome.relationships {
                        self.deliver_relationship(relationship, output).await;
                    }
                }
                Err(AppError::ValidationError { entity, field, message }) => {
                    tracing::warn!(
                        url = %page.url,
                        entity = %entity,
                        field = %field,
                        %message,
                        "Record failed validation, dropped"
                    );
                    output.validation_drops.push(entity);
                }
                Err(e) => {
                    tracing::warn!(url = %page.url, entity = %entity, error = %e, "Detail extraction failed");
                    output.extraction_drops += 1;
                }
            }
        } else {
            match driver.parse_listing(&page) {
                Ok(outcome) => {
                    for request in outcome.detail_requests {
                        output
                            .new_targets
                            .push(target.detail(request.url, request.continuation));
                    }
                    if let Some(next) = outcome.next_page {
                        output.new_targets.push(target.next_page(next));
                    }
                    for record in outcome.incomplete_records {
                        self.deliver(record, output).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %page.url, entity = %entity, error = %e, "Listing extraction failed");
                    output.extraction_drops += 1;
                }
            }
        }
    }

    async fn deliver(&self, record: ExtractedRecord, output: &mut TaskOutput) {
        if !self.dedup.admit(&record).await {
            output.records_deduplicated += 1;
            return;
        }
        match self.sink.upsert(&record).await {
            Ok(()) => output.records_delivered += 1,
            Err(e) => {
                tracing::error!(
                    entity = %record.entity_type,
                    natural_key = %record.natural_key,
                    error = %e,
                    "Sink upsert failed"
                );
                output.sink_errors += 1;
            }
        }
    }

    async fn deliver_relationship(
        &self,
        relationship: RelationshipRecord,
        output: &mut TaskOutput,
    ) {
        match self.sink.upsert_relationship(&relationship).await {
            Ok(()) => output.relationships_delivered += 1,
            Err(e) => {
                tracing::error!(
                    subject = %relationship.subject_id,
                    predicate = %relationship.predicate,
                    error = %e,
                    "Sink relationship upsert failed"
                );
                output.sink_errors += 1;
            }
        }
    }
}

fn site_map_entry(
    target: &CrawlTarget,
    status: u16,
    title: Option<String>,
    body: &str,
) -> SiteMapEntry {
    SiteMapEntry {
        url: target.url.to_string(),
        url_hash: compute_hash(target.url.as_str()),
        title,
        depth: target.depth,
        parent_url: target.parent_url.as_ref().map(|u| u.to_string()),
        status_code: status,
        content_hash: compute_hash(body),
    }
}

/// Title and out-links of a page, for Site Map mode.
fn parse_page_links(html: &str, base: &Url) -> (Option<String>, Vec<Url>) {
    use crate::drivers::{element_text, resolve_href, select_all};
    use scraper::Html;

    let doc = Html::parse_document(html);

    let title = select_all(&doc, "title")
        .first()
        .map(element_text)
        .filter(|t| !t.is_empty());

    let mut seen = HashSet::new();
    let links = select_all(&doc, "a[href]")
        .iter()
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| resolve_href(base, href))
        .map(|mut link| {
            link.set_fragment(None);
            link
        })
        .filter(|link| seen.insert(link.as_str().to_string()))
        .collect();

    (title, links)
}
