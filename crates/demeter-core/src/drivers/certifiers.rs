//! Driver for certifying bodies.

use std::collections::BTreeMap;

use scraper::Html;
use url::Url;

use crate::drivers::{
    DetailOutcome, DetailRequest, Driver, DriverStats, DriverStatsSnapshot, FetchedPage,
    ListingOutcome, SelectorPolicy, collect_standard_codes, element_text, extract_identifier,
    find_next_page, label_value_pairs, resolve_href, select_all, select_in,
};
use crate::error::AppError;
use crate::normalize::{normalize_phone, resolve_region};
use crate::records::{
    Continuation, EntityType, ExtractedRecord, Predicate, RecordFields, RelationshipRecord,
};

const LISTING_PATH: &str = "registro/certificadores";

/// Elements that list the standards a body is accredited for.
const ACCREDITED_SELECTOR: &str = "ul.estandares li, table.estandares td, div.estandares a";

pub struct CertifiersDriver {
    base: Url,
    policy: SelectorPolicy,
    stats: DriverStats,
}

impl CertifiersDriver {
    pub fn new(base: Url) -> Self {
        Self::with_policy(
            base,
            SelectorPolicy::default().with_id_params(&["id", "idCertificador", "cedula"]),
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
            if !fields.contains_key("key") && looks_like_key(cell) {
                fields.insert("key".to_string(), cell.clone());
            } else if !fields.contains_key("name") {
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
                "clave" | "cedula" | "cedula de acreditacion" => "key",
                "nombre" | "razon social" => "name",
                "responsable" | "contacto" => "contact",
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

/// Accreditation keys look like `ECE001-99` / `OC012-05`: letters, then
/// digits, a dash, more digits.
fn looks_like_key(value: &str) -> bool {
    let mut chars = value.chars().peekable();
    let mut letters = 0;
    while chars.peek().is_some_and(|c| c.is_ascii_uppercase()) {
        chars.next();
        letters += 1;
    }
    if letters == 0 {
        return false;
    }
    let mut digits = 0;
    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        chars.next();
        digits += 1;
    }
    digits > 0 && matches!(chars.next(), Some('-')) && chars.all(|c| c.is_ascii_digit())
}

/// Apply the normalization policy to contact fields: phone rewriting and
/// region resolution (unmapped regions stay blank, raw value preserved).
pub(crate) fn normalize_contact_fields(fields: &mut BTreeMap<String, String>) {
    if let Some(phone) = fields.get("phone") {
        let normalized = normalize_phone(phone);
        fields.insert("phone".to_string(), normalized);
    }
    if let Some(state) = fields.remove("state") {
        if let Some(code) = resolve_region(&state) {
            fields.insert("state_code".to_string(), code.to_string());
        }
        // Keep the raw spelling; it lands in the extra bag.
        fields.insert("state".to_string(), state);
    }
}

impl Driver for CertifiersDriver {
    fn entity_type(&self) -> EntityType {
        EntityType::Certifier
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
                    fields.entry("key".to_string()).or_insert(id);
                    let mut continuation =
                        Continuation::new(EntityType::Certifier, page.url.clone());
                    continuation.fields = fields;
                    outcome.detail_requests.push(DetailRequest { url, continuation });
                }
                _ => {
                    normalize_contact_fields(&mut fields);
                    match RecordFields::from_map(EntityType::Certifier, fields) {
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
                entity: EntityType::Certifier,
                url: page.url.to_string(),
                message: "no labeled fields found".to_string(),
            });
        }
        normalize_contact_fields(&mut fields);

        let record_fields = RecordFields::from_map(EntityType::Certifier, fields)
            .inspect_err(|_| self.stats.error())?;
        let record = ExtractedRecord::new(record_fields, &page.url);
        let at = record.extracted_at;

        let relationships = collect_standard_codes(&doc, ACCREDITED_SELECTOR)
            .into_iter()
            .map(|code| {
                RelationshipRecord::new(
                    EntityType::Certifier,
                    &record.natural_key,
                    Predicate::Accredits,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CERTIFIER_DETAIL_PAGE, page};

    fn driver() -> CertifiersDriver {
        CertifiersDriver::new(Url::parse("https://portal.example.mx/").unwrap())
    }

    #[test]
    fn test_looks_like_key() {
        assert!(looks_like_key("ECE001-99"));
        assert!(looks_like_key("OC012-05"));
        assert!(!looks_like_key("Instituto Nacional"));
        assert!(!looks_like_key("EC0217"));
        assert!(!looks_like_key("001-99"));
    }

    #[test]
    fn test_detail_normalizes_phone_and_region() {
        let driver = driver();
        let page = page(
            "https://portal.example.mx/registro/certificador?id=ECE001-99",
            CERTIFIER_DETAIL_PAGE,
        );
        let continuation = Continuation::new(
            EntityType::Certifier,
            Url::parse("https://portal.example.mx/registro/certificadores").unwrap(),
        )
        .with_field("key", "ECE001-99");

        let outcome = driver.parse_detail(&page, &continuation).unwrap();
        match &outcome.record.fields {
            RecordFields::Certifier(c) => {
                assert_eq!(c.phone.as_deref(), Some("+525512345678"));
                assert_eq!(c.state_code.as_deref(), Some("09"));
                assert_eq!(c.extra.get("state").map(String::as_str), Some("CDMX"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_detail_accredited_standards_relationships() {
        let driver = driver();
        let page = page(
            "https://portal.example.mx/registro/certificador?id=ECE001-99",
            CERTIFIER_DETAIL_PAGE,
        );
        let continuation = Continuation::new(
            EntityType::Certifier,
            Url::parse("https://portal.example.mx/registro/certificadores").unwrap(),
        );

        let outcome = driver.parse_detail(&page, &continuation).unwrap();
        let accredited: Vec<&str> = outcome
            .relationships
            .iter()
            .filter(|r| r.predicate == Predicate::Accredits)
            .map(|r| r.object_id.as_str())
            .collect();
        assert_eq!(accredited, vec!["EC0217", "EC0301"]);
        assert_eq!(outcome.record.natural_key, "ECE001-99");
    }

    #[test]
    fn test_unmapped_region_left_blank_record_still_valid() {
        let driver = driver();
        let html = r#"
            <html><body><table>
              <tr><th>Nombre</th><td>Centro Certificador del Sureste</td></tr>
              <tr><th>Clave</th><td>ECE777-01</td></tr>
              <tr><th>Estado</th><td>Unknown Place</td></tr>
            </table></body></html>
        "#;
        let page = page("https://portal.example.mx/registro/certificador?id=ECE777-01", html);
        let continuation = Continuation::new(
            EntityType::Certifier,
            Url::parse("https://portal.example.mx/registro/certificadores").unwrap(),
        );

        let outcome = driver.parse_detail(&page, &continuation).unwrap();
        match &outcome.record.fields {
            RecordFields::Certifier(c) => {
                assert_eq!(c.state_code, None);
                assert_eq!(c.extra.get("state").map(String::as_str), Some("Unknown Place"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
