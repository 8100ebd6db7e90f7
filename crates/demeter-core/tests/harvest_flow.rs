//! End-to-end harvest over a two-page listing with three detail rows.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use demeter_core::drivers::{DriverRegistry, StandardsDriver};
use demeter_core::engine::{EngineConfig, HarvestEngine};
use demeter_core::records::EntityType;
use demeter_core::store::MemoryStore;
use demeter_core::testutil::{
    MockFetcher, MockSink, STANDARD_DETAIL_PAGE, STANDARD_LISTING_PAGE, STANDARD_LISTING_PAGE_2,
};
use demeter_core::traits::NullRenderer;

const BASE: &str = "https://portal.example.mx";

const DETAIL_EC0301: &str = r#"
<html><body><table>
  <tr><th>Código:</th><td>EC0301</td></tr>
  <tr><th>Título:</th><td>Diseño de cursos de formación del capital humano</td></tr>
</table></body></html>
"#;

const DETAIL_EC0305: &str = r#"
<html><body><table>
  <tr><th>Código:</th><td>EC0305</td></tr>
  <tr><th>Título:</th><td>Prestación de servicios de atención a comensales</td></tr>
</table></body></html>
"#;

fn fixture_fetcher() -> MockFetcher {
    MockFetcher::new()
        .route(&format!("{BASE}/registro/estandares"), STANDARD_LISTING_PAGE)
        .route(
            &format!("{BASE}/registro/estandares?page=2"),
            STANDARD_LISTING_PAGE_2,
        )
        .route(
            &format!("{BASE}/registro/detalle?id=EC0217"),
            STANDARD_DETAIL_PAGE,
        )
        .route(&format!("{BASE}/registro/detalle?id=EC0301"), DETAIL_EC0301)
        .route(&format!("{BASE}/registro/detalle?id=EC0305"), DETAIL_EC0305)
}

fn standards_only_engine(
    fetcher: MockFetcher,
    sink: MockSink,
) -> HarvestEngine<MockFetcher, NullRenderer, MockSink, MemoryStore> {
    let base = Url::parse(BASE).unwrap();
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(StandardsDriver::new(base)));
    HarvestEngine::new(
        fetcher,
        sink,
        registry,
        MemoryStore::new(),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn two_page_listing_harvest() {
    let fetcher = fixture_fetcher();
    let sink = MockSink::new();
    let engine = standards_only_engine(fetcher.clone(), sink.clone());

    let summary = engine.run_targeted(CancellationToken::new()).await;

    // 2 listing fetches, 3 detail fetches, nothing else.
    assert_eq!(summary.pages_fetched, 5);
    assert_eq!(summary.pages_failed, 0);
    assert_eq!(fetcher.fetch_count(&format!("{BASE}/registro/estandares")), 1);
    assert_eq!(
        fetcher.fetch_count(&format!("{BASE}/registro/estandares?page=2")),
        1
    );
    for code in ["EC0217", "EC0301", "EC0305"] {
        assert_eq!(
            fetcher.fetch_count(&format!("{BASE}/registro/detalle?id={code}")),
            1,
            "{code}"
        );
    }

    // All three detail records reached the sink.
    assert_eq!(summary.records_extracted, 3);
    let mut keys = sink.natural_keys();
    keys.sort();
    assert_eq!(keys, vec!["EC0217", "EC0301", "EC0305"]);
    assert!(
        sink.records
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.entity_type == EntityType::Standard && r.content_hash.len() == 64)
    );

    // EC0217 carries committee + sector; EC0301 and EC0305 get their
    // sector through the listing continuation.
    assert_eq!(summary.relationships_extracted, 4);

    // The malformed listing row was dropped without raising.
    assert_eq!(summary.extraction_drops, 0);
    assert!(summary.validation_drops.is_empty());
    assert_eq!(summary.skipped.len(), 0);
    assert!(summary.open_circuits.is_empty());
}

#[tokio::test]
async fn page_two_details_never_precede_page_two_listing() {
    let fetcher = fixture_fetcher();
    let sink = MockSink::new();
    let engine = standards_only_engine(fetcher.clone(), sink);

    engine.run_targeted(CancellationToken::new()).await;

    let fetched = fetcher.fetched_urls();
    let page2_listing = fetched
        .iter()
        .position(|u| u.ends_with("estandares?page=2"))
        .expect("page 2 listing fetched");
    let page2_detail = fetched
        .iter()
        .position(|u| u.ends_with("id=EC0305"))
        .expect("page 2 detail fetched");

    assert!(
        page2_listing < page2_detail,
        "detail fetch at {page2_detail} preceded its listing at {page2_listing}: {fetched:?}"
    );
}

#[tokio::test]
async fn overlapping_run_deduplicates_unchanged_records() {
    let fetcher = fixture_fetcher();
    let sink = MockSink::new();
    let engine = standards_only_engine(fetcher, sink.clone());

    let first = engine.run_targeted(CancellationToken::new()).await;
    assert_eq!(first.records_extracted, 3);
    assert_eq!(first.records_deduplicated, 0);

    // Same content harvested again within the dedup TTL: everything is
    // suppressed before the sink.
    let second = engine.run_targeted(CancellationToken::new()).await;
    assert_eq!(second.records_extracted, 0);
    assert_eq!(second.records_deduplicated, 3);
    assert_eq!(sink.record_count(), 3);
}
