//! Driver for evaluation centers.

use std::collections::BTreeMap;

use scraper::Html;
use url::Url;

use crate::drivers::certifiers::normalize_contact_fields;
use crate::drivers::{
    DetailOutcome, DetailRequest, Driver, DriverStats, DriverStatsSnapshot, FetchedPage,
    ListingOutcome, SelectorPolicy, collect_standard_codes, element_text, extract_identifier,
    find_next_page, label_value_pairs, resolve_href, select_all, select_in,
};
use crate::error::AppError;
use crate::records::{
    Continuation, EntityType, ExtractedRecord, Predicate, RecordFields, RelationshipRecord,
};

const LISTING_PATH: &str = "registro/centros";

/// Elements listing the standards a center evaluates.
const EVALUATED_SELECTOR: &str = "ul.estandares li, table.estandares td, div.estandares a";

pub struct CentersDriver {
    base: Url,
    policy: SelectorPolicy,
    stats: DriverStats,
}

impl CentersDriver {
    pub fn new(base: Url) -> Self {
        Self::with_policy(
            base,
            SelectorPolicy::default().with_id_params(&["id", "idCentro"]),
        )
    }

    pub fn with_policy(base: Url, policy: SelectorPolicy) -> Self {
        Self {
            base,
            policy,
            stats: DriverStats::default(),
        }
    }

    fn row_fields(cells: &[String]) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        for cell in cells.iter().filter(|c| !c.is_empty()) {
            if !fields.contains_key("name") {
                fields.insert("name".to_string(), cell.clone());
            } else if !fields.contains_key("state") {
                fields.insert("state".to_string(), cell.clone());
            }
        }
        fields
    }

    fn detail_fields(doc: &Html) -> BTreeMap<String, String> {
        let labeled = label_value_pairs(doc);
        let mut fields = BTreeMap::new();
        for (label, value) in labeled {
            let key = match label.as_str() {
                "clave" | "clave del centro" => "key",
                "nombre" | "nombre del centro" => "name",
                "telefono" => "phone",
                "correo" | "correo electronico" | "email" => "email",
                "estado" | "entidad federativa" => "state",
                "domicilio" | "direccion" => "address",
                other => other,
            };
            fields.insert(key.to_string(), value);
        }
        fields
    }
}

impl Driver for CentersDriver {
    fn entity_type(&self) -> EntityType {
        EntityType::EvaluationCenter
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
            let mut cells: Vec<String> = select_in(&row, "td").iter().map(element_text).collect();
            if cells.is_empty() {
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
                    fields.insert("key".to_string(), id);
                    let mut continuation =
                        Continuation::new(EntityType::EvaluationCenter, page.url.clone());
                    continuation.fields = fields;
                    outcome.detail_requests.push(DetailRequest { url, continuation });
                }
                _ => {
                    normalize_contact_fields(&mut fields);
                    match RecordFields::from_map(EntityType::EvaluationCenter, fields) {
                        Ok(partial) => outcome
                            .incomplete_records
                            .push(ExtractedRecord::new(partial, &page.url)),
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
                entity: EntityType::EvaluationCenter,
                url: page.url.to_string(),
                message: "no labeled fields found".to_string(),
            });
        }
        normalize_contact_fields(&mut fields);

        let record_fields = RecordFields::from_map(EntityType::EvaluationCenter, fields)
            .inspect_err(|_| self.stats.error())?;
        let record = ExtractedRecord::new(record_fields, &page.url);
        let at = record.extracted_at;

        let relationships = collect_standard_codes(&doc, EVALUATED_SELECTOR)
            .into_iter()
            .map(|code| {
                RelationshipRecord::new(
                    EntityType::EvaluationCenter,
                    &record.natural_key,
                    Predicate::Evaluates,
                    EntityType::Standard,
                    code,
                    at,
                )
            })
            .collect();

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
