//! Extraction drivers: one per entity type, uniform contract hiding the
//! listing → detail two-phase structure.
//!
//! Drivers are pure functions of one response plus its continuation. They
//! hold no cross-request mutable state beyond run counters, which is what
//! lets many drivers and requests run concurrently without coordination.

pub mod centers;
pub mod certifiers;
pub mod sectors;
pub mod standards;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::AppError;
use crate::normalize::clean_text;
use crate::records::{Continuation, EntityType, ExtractedRecord, RelationshipRecord};

pub use centers::CentersDriver;
pub use certifiers::CertifiersDriver;
pub use sectors::SectorsDriver;
pub use standards::StandardsDriver;

/// A fetched page handed to a driver. The body is parsed inside the
/// driver call so no parsed DOM ever crosses a task boundary.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub status: u16,
    pub body: String,
}

/// A detail request emitted by `parse_listing`, carrying the listing
/// row's partial fields as its continuation.
#[derive(Debug, Clone)]
pub struct DetailRequest {
    pub url: Url,
    pub continuation: Continuation,
}

/// Everything a listing page produced.
#[derive(Debug, Clone, Default)]
pub struct ListingOutcome {
    pub detail_requests: Vec<DetailRequest>,
    pub next_page: Option<Url>,
    /// Candidates without a resolvable identifier, forwarded with the
    /// listing fields alone when those already validate.
    pub incomplete_records: Vec<ExtractedRecord>,
}

/// Everything a detail page produced.
#[derive(Debug, Clone)]
pub struct DetailOutcome {
    pub record: ExtractedRecord,
    pub relationships: Vec<RelationshipRecord>,
    /// Secondary records embedded in the same page (e.g. the committees
    /// listed on a sector page). They share the primary record's
    /// extraction timestamp.
    pub nested_records: Vec<ExtractedRecord>,
}

/// Per-driver run counters (the only mutable driver state).
#[derive(Debug, Default)]
pub struct DriverStats {
    pages_processed: AtomicU64,
    items_extracted: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of [`DriverStats`] for the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DriverStatsSnapshot {
    pub pages_processed: u64,
    pub items_extracted: u64,
    pub errors: u64,
}

impl DriverStats {
    pub fn page(&self) {
        self.pages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn items(&self, count: u64) {
        self.items_extracted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DriverStatsSnapshot {
        DriverStatsSnapshot {
            pages_processed: self.pages_processed.load(Ordering::Relaxed),
            items_extracted: self.items_extracted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Capability contract the scheduler depends on; one implementation per
/// entity type.
pub trait Driver: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Fixed entry points for Targeted Harvest mode.
    fn start_urls(&self) -> Vec<Url>;

    /// Extract detail/next-page requests (and incomplete records) from a
    /// listing page.
    fn parse_listing(&self, page: &FetchedPage) -> Result<ListingOutcome, AppError>;

    /// Extract the full record and its page-local relationships from a
    /// detail page, merging the continuation carried by the request.
    fn parse_detail(
        &self,
        page: &FetchedPage,
        continuation: &Continuation,
    ) -> Result<DetailOutcome, AppError>;

    fn stats(&self) -> DriverStatsSnapshot;
}

/// Registry of drivers; the scheduler looks up the owner of each target
/// by entity type.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all four portal drivers rooted at `base`.
    pub fn standard_set(base: &Url) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StandardsDriver::new(base.clone())));
        registry.register(Arc::new(CertifiersDriver::new(base.clone())));
        registry.register(Arc::new(CentersDriver::new(base.clone())));
        registry.register(Arc::new(SectorsDriver::new(base.clone())));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.push(driver);
    }

    pub fn get(&self, entity: EntityType) -> Option<&Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.entity_type() == entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Driver>> {
        self.drivers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

/// Per-site selector configuration for one driver.
///
/// The chains are heuristics tuned to one portal's observed markup, kept
/// as data so site drift is a config change. None of them is assumed
/// exhaustive.
#[derive(Debug, Clone)]
pub struct SelectorPolicy {
    /// Primary listing strategy: table rows.
    pub rows: String,
    /// Secondary listing strategy when `rows` yields nothing: cards.
    pub cards: String,
    /// Anchor within a row/card that leads to the detail page.
    pub link: String,
    /// Pagination selectors, tried in priority order; first match wins.
    pub pagination: Vec<String>,
    /// Query parameters that may carry the row identifier.
    pub id_params: Vec<String>,
}

impl Default for SelectorPolicy {
    fn default() -> Self {
        Self {
            rows: "table tbody tr".to_string(),
            cards: "div.card, li.resultado".to_string(),
            link: "a[href]".to_string(),
            pagination: vec![
                "a[rel='next']".to_string(),
                "li.siguiente a[href]".to_string(),
                "li.next a[href]".to_string(),
                "a.page-next[href]".to_string(),
                "ul.pagination li.active + li a[href]".to_string(),
            ],
            id_params: vec!["id".to_string()],
        }
    }
}

impl SelectorPolicy {
    pub fn with_id_params(mut self, params: &[&str]) -> Self {
        self.id_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_rows(mut self, rows: &str) -> Self {
        self.rows = rows.to_string();
        self
    }
}

/// Select all matches for a selector string; invalid selectors log and
/// match nothing.
pub(crate) fn select_all<'a>(doc: &'a Html, selector: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(selector) {
        Ok(sel) => doc.select(&sel).collect(),
        Err(_) => {
            tracing::warn!(selector = %selector, "Invalid selector in policy");
            Vec::new()
        }
    }
}

/// Select within an element's subtree.
pub(crate) fn select_in<'a>(element: &ElementRef<'a>, selector: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(selector) {
        Ok(sel) => element.select(&sel).collect(),
        Err(_) => {
            tracing::warn!(selector = %selector, "Invalid selector in policy");
            Vec::new()
        }
    }
}

/// First element matching any selector in the chain, in priority order.
pub(crate) fn select_chain<'a>(doc: &'a Html, chain: &[String]) -> Option<ElementRef<'a>> {
    for selector in chain {
        if let Some(found) = select_all(doc, selector).into_iter().next() {
            return Some(found);
        }
    }
    None
}

/// Cleaned text content of an element.
pub(crate) fn element_text(element: &ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

/// Resolve an href against the page URL; rejects anchors and non-HTTP
/// schemes.
pub(crate) fn resolve_href(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let resolved = base.join(href).ok()?;
    matches!(resolved.scheme(), "http" | "https").then_some(resolved)
}

/// Pull the row identifier out of a detail link's query string.
///
/// Tries proper query-pair parsing first, then a tolerant raw scan that
/// accepts the malformed separators seen in the wild (`;`, stray spaces):
/// the value runs from `<param>=` to the next separator.
pub(crate) fn extract_identifier(url: &Url, id_params: &[String]) -> Option<String> {
    for (key, value) in url.query_pairs() {
        if id_params.iter().any(|p| p == key.as_ref()) {
            // Pair parsing splits on '&' only; trim at the lax separators.
            let value = value.split([';', '#', ' ']).next().unwrap_or("");
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    let query = url.query()?;
    for param in id_params {
        let needle = format!("{param}=");
        if let Some(pos) = query.find(&needle) {
            let rest = &query[pos + needle.len()..];
            let end = rest
                .find(['&', ';', '#', ' '])
                .unwrap_or(rest.len());
            let value = &rest[..end];
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Next-page URL per the policy's pagination chain.
pub(crate) fn find_next_page(doc: &Html, base: &Url, policy: &SelectorPolicy) -> Option<Url> {
    let element = select_chain(doc, &policy.pagination)?;
    let href = element.value().attr("href")?;
    resolve_href(base, href)
}

/// Normalize a label cell for map lookup: lowercase, accents stripped,
/// trailing colon dropped.
pub(crate) fn normalize_label(raw: &str) -> String {
    clean_text(raw)
        .trim_end_matches(':')
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'Á' | 'À' => 'a',
            'é' | 'è' | 'É' | 'È' => 'e',
            'í' | 'ì' | 'Í' | 'Ì' => 'i',
            'ó' | 'ò' | 'Ó' | 'Ò' => 'o',
            'ú' | 'ù' | 'ü' | 'Ú' | 'Ù' | 'Ü' => 'u',
            'ñ' | 'Ñ' => 'n',
            other => other.to_ascii_lowercase(),
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Collect label → value pairs from the usual detail-page layouts:
/// two-cell table rows (`th`/`td` or `td`/`td`) and definition lists.
pub(crate) fn label_value_pairs(doc: &Html) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();

    for row in select_all(doc, "table tr") {
        let cells: Vec<String> = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| matches!(el.value().name(), "td" | "th"))
            .map(|el| element_text(&el))
            .collect();
        if let [label, value] = cells.as_slice()
            && !label.is_empty()
            && !value.is_empty()
        {
            pairs.insert(normalize_label(label), value.clone());
        }
    }

    let terms = select_all(doc, "dl dt");
    let defs = select_all(doc, "dl dd");
    for (term, def) in terms.iter().zip(defs.iter()) {
        let label = normalize_label(&element_text(term));
        let value = element_text(def);
        if !label.is_empty() && !value.is_empty() {
            pairs.insert(label, value);
        }
    }

    pairs
}

/// Scan elements under `selector` for standard codes (EC + four digits),
/// in document order, deduplicated.
pub(crate) fn collect_standard_codes(doc: &Html, selector: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut codes = Vec::new();
    for element in select_all(doc, selector) {
        for token in element_text(&element).split(|c: char| !c.is_ascii_alphanumeric()) {
            if crate::records::is_valid_standard_code(token) && seen.insert(token.to_string()) {
                codes.push(token.to_string());
            }
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_identifier_query_pairs() {
        let policy = SelectorPolicy::default();
        let url = Url::parse("https://portal.example.mx/detail?id=EC0217&lang=es").unwrap();
        assert_eq!(
            extract_identifier(&url, &policy.id_params),
            Some("EC0217".to_string())
        );
    }

    #[test]
    fn test_extract_identifier_tolerant_scan() {
        let policy = SelectorPolicy::default().with_id_params(&["idCentro"]);
        // Semicolon separator defeats proper pair parsing per param; the
        // raw scan still finds the value.
        let url = Url::parse("https://portal.example.mx/detail?idCentro=CE42;x=1").unwrap();
        assert_eq!(
            extract_identifier(&url, &policy.id_params),
            Some("CE42".to_string())
        );
    }

    #[test]
    fn test_extract_identifier_param_behind_lax_separator() {
        let policy = SelectorPolicy::default();
        // `id` never surfaces as a proper pair here; only the raw scan
        // can see it.
        let url = Url::parse("https://portal.example.mx/detail?x=1;id=EC0217").unwrap();
        assert_eq!(
            extract_identifier(&url, &policy.id_params),
            Some("EC0217".to_string())
        );
    }

    #[test]
    fn test_extract_identifier_missing() {
        let policy = SelectorPolicy::default();
        let url = Url::parse("https://portal.example.mx/detail?page=3").unwrap();
        assert_eq!(extract_identifier(&url, &policy.id_params), None);
        let no_query = Url::parse("https://portal.example.mx/detail").unwrap();
        assert_eq!(extract_identifier(&no_query, &policy.id_params), None);
    }

    #[test]
    fn test_find_next_page_priority_order() {
        let policy = SelectorPolicy::default();
        let base = Url::parse("https://portal.example.mx/list?page=1").unwrap();
        let html = r#"
            <html><body>
              <ul class="pagination">
                <li class="active"><a href="?page=1">1</a></li>
                <li><a href="?page=2">2</a></li>
              </ul>
              <a rel="next" href="?page=2">Siguiente</a>
            </body></html>
        "#;
        let doc = Html::parse_document(html);
        let next = find_next_page(&doc, &base, &policy).unwrap();
        assert_eq!(next.as_str(), "https://portal.example.mx/list?page=2");
    }

    #[test]
    fn test_find_next_page_fallback_selector() {
        let policy = SelectorPolicy::default();
        let base = Url::parse("https://portal.example.mx/list").unwrap();
        let html = r#"
            <html><body>
              <ul class="pagination">
                <li class="active"><a href="?page=1">1</a></li>
                <li><a href="?page=2">2</a></li>
              </ul>
            </body></html>
        "#;
        let doc = Html::parse_document(html);
        let next = find_next_page(&doc, &base, &policy).unwrap();
        assert_eq!(next.as_str(), "https://portal.example.mx/list?page=2");
    }

    #[test]
    fn test_find_next_page_none() {
        let policy = SelectorPolicy::default();
        let base = Url::parse("https://portal.example.mx/list").unwrap();
        let doc = Html::parse_document("<html><body><p>fin</p></body></html>");
        assert!(find_next_page(&doc, &base, &policy).is_none());
    }

    #[test]
    fn test_label_value_pairs_table_and_dl() {
        let html = r#"
            <html><body>
              <table>
                <tr><th>Título:</th><td>Algo útil</td></tr>
                <tr><td>Comité</td><td>Comité de Gestión</td></tr>
                <tr><td>solo una celda</td></tr>
              </table>
              <dl><dt>Nivel</dt><dd>3</dd></dl>
            </body></html>
        "#;
        let doc = Html::parse_document(html);
        let pairs = label_value_pairs(&doc);
        assert_eq!(pairs.get("titulo").unwrap(), "Algo útil");
        assert_eq!(pairs.get("comite").unwrap(), "Comité de Gestión");
        assert_eq!(pairs.get("nivel").unwrap(), "3");
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn test_collect_standard_codes() {
        let html = r#"
            <html><body>
              <ul class="estandares">
                <li>EC0217 — Impartición de cursos</li>
                <li>EC0301: Diseño de cursos</li>
                <li>EC0217 (repetido)</li>
                <li>Sin código</li>
              </ul>
            </body></html>
        "#;
        let doc = Html::parse_document(html);
        let codes = collect_standard_codes(&doc, "ul.estandares li");
        assert_eq!(codes, vec!["EC0217".to_string(), "EC0301".to_string()]);
    }

    #[test]
    fn test_resolve_href_filters() {
        let base = Url::parse("https://portal.example.mx/list").unwrap();
        assert!(resolve_href(&base, "detalle?id=1").is_some());
        assert!(resolve_href(&base, "#top").is_none());
        assert!(resolve_href(&base, "javascript:void(0)").is_none());
        assert!(resolve_href(&base, "mailto:x@y.mx").is_none());
    }
}
