//! Driver for competency standards (EC codes).

use std::collections::BTreeMap;

use scraper::Html;
use url::Url;

use crate::drivers::{
    DetailOutcome, DetailRequest, Driver, DriverStats, DriverStatsSnapshot, FetchedPage,
    ListingOutcome, SelectorPolicy, element_text, extract_identifier, find_next_page,
    label_value_pairs, resolve_href, select_all, select_in,
};
use crate::error::AppError;
use crate::records::{
    Continuation, EntityType, ExtractedRecord, Predicate, RecordFields, RelationshipRecord,
    is_valid_standard_code,
};

/// Listing entry point, relative to the portal base.
const LISTING_PATH: &str = "registro/estandares";

pub struct StandardsDriver {
    base: Url,
    policy: SelectorPolicy,
    stats: DriverStats,
}

impl StandardsDriver {
    pub fn new(base: Url) -> Self {
        Self::with_policy(
            base,
            SelectorPolicy::default().with_id_params(&["id", "idEstandar", "codigo"]),
        )
    }

    pub fn with_policy(base: Url, policy: SelectorPolicy) -> Self {
        Self {
            base,
            policy,
            stats: DriverStats::default(),
        }
    }

    /// Partial fields from one listing row: code (first cell when it
    /// looks like one), title, sector.
    fn row_fields(cells: &[String]) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        let mut cells = cells.iter();
        if let Some(first) = cells.next() {
            if is_valid_standard_code(first) {
                fields.insert("code".to_string(), first.clone());
            } else if !first.is_empty() {
                fields.insert("title".to_string(), first.clone());
            }
        }
        for cell in cells {
            if cell.is_empty() {
                continue;
            }
            if !fields.contains_key("title") {
                fields.insert("title".to_string(), cell.clone());
            } else if !fields.contains_key("sector") {
                fields.insert("sector".to_string(), cell.clone());
            }
        }
        fields
    }

    /// Map the detail page's labeled values onto canonical field keys.
    fn detail_fields(doc: &Html) -> BTreeMap<String, String> {
        let labeled = label_value_pairs(doc);
        let mut fields = BTreeMap::new();
        for (label, value) in labeled {
            let key = match label.as_str() {
                "codigo" | "clave" | "clave del estandar" => "code",
                "titulo" | "titulo del estandar" => "title",
                "proposito" => "purpose",
                "nivel" | "nivel de competencia" => "level",
                "sector" | "sector productivo" => "sector",
                "comite" | "comite de gestion por competencias" => "committee",
                "fecha de publicacion" | "publicacion en el dof" => "published",
                other => other,
            };
            fields.insert(key.to_string(), value);
        }
        fields
    }
}

impl Driver for StandardsDriver {
    fn entity_type(&self) -> EntityType {
        EntityType::Standard
    }

    fn start_urls(&self) -> Vec<Url> {
        self.base.join(LISTING_PATH).into_iter().collect()
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<ListingOutcome, AppError> {
        self.stats.page();
        let doc = Html::parse_document(&page.body);

        let mut rows = select_all(&doc, &self.policy.rows);
        if rows.is_empty() {
            rows = select_all(&doc, &self.policy.cards);
        }

        let mut outcome = ListingOutcome::default();
        for row in rows {
            let mut cells: Vec<String> = select_in(&row, "td")
                .iter()
                .map(element_text)
                .collect();
            if cells.is_empty() {
                // Card layout: the anchor text is the title.
                cells = select_in(&row, &self.policy.link)
                    .iter()
                    .map(element_text)
                    .collect();
            }
            let mut fields = Self::row_fields(&cells);

            let link = select_in(&row, &self.policy.link)
                .first()
                .and_then(|a| a.value().attr("href").map(str::to_string));

            let detail_url = link.as_deref().and_then(|href| resolve_href(&page.url, href));
            let identifier =
                detail_url.as_ref().and_then(|u| extract_identifier(u, &self.policy.id_params));

            match (detail_url, identifier) {
                (Some(url), Some(id)) => {
                    if is_valid_standard_code(&id) {
                        fields.insert("code".to_string(), id);
                    }
                    let mut continuation =
                        Continuation::new(EntityType::Standard, page.url.clone());
                    continuation.fields = fields;
                    outcome.detail_requests.push(DetailRequest { url, continuation });
                }
                _ => {
                    // No resolvable identifier; forward what the row gave
                    // us when it already validates, otherwise drop it.
                    match RecordFields::from_map(EntityType::Standard, fields) {
                        Ok(partial) => {
                            outcome
                                .incomplete_records
                                .push(ExtractedRecord::new(partial, &page.url));
                        }
                        Err(e) => {
                            self.stats.error();
                            tracing::debug!(
                                url = %page.url,
                                error = %e,
                                "Listing row without resolvable identifier dropped"
                            );
                        }
                    }
                }
            }
        }

        self.stats.items(outcome.detail_requests.len() as u64);
        outcome.next_page = find_next_page(&doc, &page.url, &self.policy);
        Ok(outcome)
    }

    fn parse_detail(
        &self,
        page: &FetchedPage,
        continuation: &Continuation,
    ) -> Result<DetailOutcome, AppError> {
        self.stats.page();
        let doc = Html::parse_document(&page.body);

        let mut fields = Self::detail_fields(&doc);
        continuation.merge_into(&mut fields);
        if fields.is_empty() {
            self.stats.error();
            return Err(AppError::ExtractionError {
                entity: EntityType::Standard,
                url: page.url.to_string(),
                message: "no labeled fields found".to_string(),
            });
        }

        let record_fields = RecordFields::from_map(EntityType::Standard, fields)
            .inspect_err(|_| self.stats.error())?;

        let record = ExtractedRecord::new(record_fields, &page.url);
        let at = record.extracted_at;
        let mut relationships = Vec::new();

        if let RecordFields::Standard(standard) = &record.fields {
            if let Some(committee) = &standard.committee {
                relationships.push(RelationshipRecord::new(
                    EntityType::Standard,
                    &record.natural_key,
                    Predicate::IssuedBy,
                    EntityType::Committee,
                    committee.clone(),
                    at,
                ));
            }
            if let Some(sector) = &standard.sector {
                relationships.push(RelationshipRecord::new(
                    EntityType::Standard,
                    &record.natural_key,
                    Predicate::BelongsTo,
                    EntityType::Sector,
                    sector.clone(),
                    at,
                ));
            }
        }

        self.stats.items(1);
        Ok(DetailOutcome {
            record,
            relationships,
            nested_records: Vec::new(),
        })
    }

    fn stats(&self) -> DriverStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{STANDARD_DETAIL_PAGE, STANDARD_LISTING_PAGE, page};

    fn driver() -> StandardsDriver {
        StandardsDriver::new(Url::parse("https://portal.example.mx/").unwrap())
    }

    #[test]
    fn test_listing_rows_become_detail_requests() {
        let driver = driver();
        let page = page("https://portal.example.mx/registro/estandares", STANDARD_LISTING_PAGE);
        let outcome = driver.parse_listing(&page).unwrap();

        assert_eq!(outcome.detail_requests.len(), 2);
        let first = &outcome.detail_requests[0];
        assert_eq!(
            first.url.as_str(),
            "https://portal.example.mx/registro/detalle?id=EC0217"
        );
        assert_eq!(first.continuation.fields.get("code").unwrap(), "EC0217");
        assert!(first.continuation.fields.contains_key("title"));
    }

    #[test]
    fn test_listing_malformed_identifier_never_raises() {
        let driver = driver();
        // Third row's link has no id parameter at all.
        let page = page("https://portal.example.mx/registro/estandares", STANDARD_LISTING_PAGE);
        let outcome = driver.parse_listing(&page).unwrap();

        // The malformed row is not among the detail requests.
        assert!(
            outcome
                .detail_requests
                .iter()
                .all(|r| r.url.query().is_some_and(|q| q.contains("id=")))
        );
    }

    #[test]
    fn test_listing_next_page() {
        let driver = driver();
        let page = page("https://portal.example.mx/registro/estandares", STANDARD_LISTING_PAGE);
        let outcome = driver.parse_listing(&page).unwrap();
        assert_eq!(
            outcome.next_page.unwrap().as_str(),
            "https://portal.example.mx/registro/estandares?page=2"
        );
    }

    #[test]
    fn test_card_fallback_when_no_table() {
        let driver = driver();
        let html = r#"
            <html><body>
              <div class="card">
                <a href="/registro/detalle?id=EC0305">Prestación de servicios de atención</a>
              </div>
            </body></html>
        "#;
        let page = page("https://portal.example.mx/registro/estandares", html);
        let outcome = driver.parse_listing(&page).unwrap();
        assert_eq!(outcome.detail_requests.len(), 1);
        assert_eq!(
            outcome.detail_requests[0].continuation.fields.get("code").unwrap(),
            "EC0305"
        );
    }

    #[test]
    fn test_detail_merges_continuation_and_extracts_relationships() {
        let driver = driver();
        let page = page(
            "https://portal.example.mx/registro/detalle?id=EC0217",
            STANDARD_DETAIL_PAGE,
        );
        let continuation = Continuation::new(
            EntityType::Standard,
            Url::parse("https://portal.example.mx/registro/estandares").unwrap(),
        )
        .with_field("code", "EC0217")
        .with_field("sector", "Sector listado");

        let outcome = driver.parse_detail(&page, &continuation).unwrap();
        assert_eq!(outcome.record.natural_key, "EC0217");
        match &outcome.record.fields {
            RecordFields::Standard(s) => {
                // Detail page wins over the listing value.
                assert_eq!(s.sector.as_deref(), Some("Educación y formación"));
                assert_eq!(s.level.as_deref(), Some("3"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }

        assert_eq!(outcome.relationships.len(), 2);
        assert!(
            outcome
                .relationships
                .iter()
                .any(|r| r.predicate == Predicate::IssuedBy)
        );
        let at = outcome.record.extracted_at;
        assert!(outcome.relationships.iter().all(|r| r.extracted_at == at));
    }

    #[test]
    fn test_detail_validation_failure_counts_error() {
        let driver = driver();
        let page = page(
            "https://portal.example.mx/registro/detalle?id=0217",
            "<html><body><table><tr><th>Título</th><td>Un título válido</td></tr></table></body></html>",
        );
        let continuation = Continuation::new(
            EntityType::Standard,
            Url::parse("https://portal.example.mx/registro/estandares").unwrap(),
        )
        .with_field("code", "0217");

        let err = driver.parse_detail(&page, &continuation).unwrap_err();
        assert!(matches!(err, AppError::ValidationError { .. }));
        assert_eq!(driver.stats().errors, 1);
    }
}
