//! Driver for the sector/committee taxonomy.
//!
//! Sector detail pages embed their committees, so this driver is the one
//! case where `parse_detail` yields nested records: the Sector itself
//! plus one Committee record per listed committee, linked `belongs-to`.

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
};

const LISTING_PATH: &str = "registro/sectores";

/// Committee entries on a sector detail page.
const COMMITTEE_SELECTOR: &str = "ul.comites li, table.comites tr";

pub struct SectorsDriver {
    base: Url,
    policy: SelectorPolicy,
    stats: DriverStats,
}

impl SectorsDriver {
    pub fn new(base: Url) -> Self {
        Self::with_policy(
            base,
            SelectorPolicy::default().with_id_params(&["id", "sector", "idSector"]),
        )
    }

    pub fn with_policy(base: Url, policy: SelectorPolicy) -> Self {
        Self {
            base,
            policy,
            stats: DriverStats::default(),
        }
    }

    fn detail_fields(doc: &Html) -> BTreeMap<String, String> {
        let labeled = label_value_pairs(doc);
        let mut fields = BTreeMap::new();
        for (label, value) in labeled {
            let key = match label.as_str() {
                "sector" | "nombre" | "nombre del sector" => "name",
                "clave" | "numero" => "sector_id",
                other => other,
            };
            fields.insert(key.to_string(), value);
        }
        fields
    }
}

impl Driver for SectorsDriver {
    fn entity_type(&self) -> EntityType {
        EntityType::Sector
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
            let name = select_in(&row, &self.policy.link)
                .first()
                .map(element_text)
                .or_else(|| {
                    select_in(&row, "td").first().map(element_text)
                })
                .unwrap_or_default();

            let link = select_in(&row, &self.policy.link)
                .first()
                .and_then(|a| a.value().attr("href").map(str::to_string));
            let detail_url = link.as_deref().and_then(|href| resolve_href(&page.url, href));
            let identifier =
                detail_url.as_ref().and_then(|u| extract_identifier(u, &self.policy.id_params));

            if let (Some(url), Some(id)) = (detail_url, identifier) {
                let continuation = Continuation::new(EntityType::Sector, page.url.clone())
                    .with_field("sector_id", id)
                    .with_field("name", name);
                outcome.detail_requests.push(DetailRequest { url, continuation });
            } else if !name.is_empty() {
                self.stats.error();
                tracing::debug!(url = %page.url, row = %name, "Sector row without identifier dropped");
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
                entity: EntityType::Sector,
                url: page.url.to_string(),
                message: "no labeled fields found".to_string(),
            });
        }

        let record_fields = RecordFields::from_map(EntityType::Sector, fields)
            .inspect_err(|_| self.stats.error())?;
        let record = ExtractedRecord::new(record_fields, &page.url);
        let at = record.extracted_at;
        let sector_id = record.natural_key.clone();

        let mut relationships = Vec::new();
        let mut nested_records = Vec::new();
        for item in select_all(&doc, COMMITTEE_SELECTOR) {
            let name = element_text(&item);
            let committee_id = select_in(&item, "a[href]")
                .first()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| resolve_href(&page.url, href))
                .and_then(|u| {
                    extract_identifier(&u, &["comite".to_string(), "idComite".to_string()])
                });

            let Some(committee_id) = committee_id else {
                continue;
            };

            let mut map = BTreeMap::new();
            map.insert("committee_id".to_string(), committee_id.clone());
            map.insert("name".to_string(), name);
            map.insert("sector_id".to_string(), sector_id.clone());
            match RecordFields::from_map(EntityType::Committee, map) {
                Ok(committee_fields) => {
                    nested_records
                        .push(ExtractedRecord::new(committee_fields, &page.url).with_timestamp(at));
                    relationships.push(RelationshipRecord::new(
                        EntityType::Committee,
                        committee_id,
                        Predicate::BelongsTo,
                        EntityType::Sector,
                        sector_id.clone(),
                        at,
                    ));
                }
                Err(e) => {
                    self.stats.error();
                    tracing::debug!(url = %page.url, error = %e, "Committee entry dropped");
                }
            }
        }

        self.stats.items(1 + nested_records.len() as u64);
        Ok(DetailOutcome {
            record,
            relationships,
            nested_records,
        })
    }

    fn stats(&self) -> DriverStatsSnapshot {
        self.stats.snapshot()
    }
}
