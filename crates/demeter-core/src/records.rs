use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::fingerprint::fingerprint_fields;

/// Entity types harvested from the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Standard,
    Certifier,
    EvaluationCenter,
    Sector,
    Committee,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Standard => "standard",
            EntityType::Certifier => "certifier",
            EntityType::EvaluationCenter => "evaluation_center",
            EntityType::Sector => "sector",
            EntityType::Committee => "committee",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(EntityType::Standard),
            "certifier" => Ok(EntityType::Certifier),
            "evaluation_center" | "center" => Ok(EntityType::EvaluationCenter),
            "sector" => Ok(EntityType::Sector),
            "committee" => Ok(EntityType::Committee),
            _ => Err(format!("Unknown entity type: {s}")),
        }
    }
}

/// A competency standard (EC code + descriptive fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardFields {
    pub code: String,
    pub title: String,
    pub sector: Option<String>,
    pub committee: Option<String>,
    pub level: Option<String>,
    pub purpose: Option<String>,
    pub published: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// An organization accredited to certify against standards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertifierFields {
    pub key: String,
    pub name: String,
    pub contact: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub state_code: Option<String>,
    pub address: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// A physical site authorized to administer evaluations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CenterFields {
    pub key: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub state_code: Option<String>,
    pub address: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// A productive-sector taxonomy node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectorFields {
    pub sector_id: String,
    pub name: String,
    pub extra: BTreeMap<String, String>,
}

/// A standardization committee within a sector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitteeFields {
    pub committee_id: String,
    pub name: String,
    pub sector_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// Tagged union of per-entity record schemas.
///
/// The entity type is statically known at every construction site, so
/// records carry fixed schemas with a bounded `extra` bag instead of a
/// schemaless map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum RecordFields {
    Standard(StandardFields),
    Certifier(CertifierFields),
    EvaluationCenter(CenterFields),
    Sector(SectorFields),
    Committee(CommitteeFields),
}

/// Bounds for a standard title, characters.
const STANDARD_TITLE_LEN: std::ops::RangeInclusive<usize> = 5..=250;

fn take(map: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    map.remove(key).filter(|v| !v.is_empty())
}

/// A standard code is `EC` followed by exactly four digits.
pub fn is_valid_standard_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 6
        && bytes[0] == b'E'
        && bytes[1] == b'C'
        && bytes[2..].iter().all(u8::is_ascii_digit)
}

impl RecordFields {
    /// Build typed fields from a merged field map, validating the
    /// entity-specific rules. Unrecognized keys are preserved in `extra`.
    pub fn from_map(
        entity: EntityType,
        mut map: BTreeMap<String, String>,
    ) -> Result<Self, AppError> {
        let require = |value: Option<String>, field: &str| {
            value.ok_or_else(|| AppError::ValidationError {
                entity,
                field: field.to_string(),
                message: "missing required field".to_string(),
            })
        };

        match entity {
            EntityType::Standard => {
                let code = require(take(&mut map, "code"), "code")?;
                if !is_valid_standard_code(&code) {
                    return Err(AppError::ValidationError {
                        entity,
                        field: "code".to_string(),
                        message: format!("'{code}' does not match EC####"),
                    });
                }
                let title = require(take(&mut map, "title"), "title")?;
                let title_len = title.chars().count();
                if !STANDARD_TITLE_LEN.contains(&title_len) {
                    return Err(AppError::ValidationError {
                        entity,
                        field: "title".to_string(),
                        message: format!("length {title_len} outside allowed range"),
                    });
                }
                let fields = StandardFields {
                    code,
                    title,
                    sector: take(&mut map, "sector"),
                    committee: take(&mut map, "committee"),
                    level: take(&mut map, "level"),
                    purpose: take(&mut map, "purpose"),
                    published: take(&mut map, "published"),
                    extra: map,
                };
                Ok(RecordFields::Standard(fields))
            }
            EntityType::Certifier => {
                let fields = CertifierFields {
                    key: require(take(&mut map, "key"), "key")?,
                    name: require(take(&mut map, "name"), "name")?,
                    contact: take(&mut map, "contact"),
                    phone: take(&mut map, "phone"),
                    email: take(&mut map, "email"),
                    state_code: take(&mut map, "state_code"),
                    address: take(&mut map, "address"),
                    extra: map,
                };
                Ok(RecordFields::Certifier(fields))
            }
            EntityType::EvaluationCenter => {
                let fields = CenterFields {
                    key: require(take(&mut map, "key"), "key")?,
                    name: require(take(&mut map, "name"), "name")?,
                    phone: take(&mut map, "phone"),
                    email: take(&mut map, "email"),
                    state_code: take(&mut map, "state_code"),
                    address: take(&mut map, "address"),
                    extra: map,
                };
                Ok(RecordFields::EvaluationCenter(fields))
            }
            EntityType::Sector => {
                let sector_id = require(take(&mut map, "sector_id"), "sector_id")?;
                if !sector_id.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(AppError::ValidationError {
                        entity,
                        field: "sector_id".to_string(),
                        message: format!("'{sector_id}' is not numeric"),
                    });
                }
                let fields = SectorFields {
                    sector_id,
                    name: require(take(&mut map, "name"), "name")?,
                    extra: map,
                };
                Ok(RecordFields::Sector(fields))
            }
            EntityType::Committee => {
                let committee_id = require(take(&mut map, "committee_id"), "committee_id")?;
                if !committee_id.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(AppError::ValidationError {
                        entity,
                        field: "committee_id".to_string(),
                        message: format!("'{committee_id}' is not numeric"),
                    });
                }
                let fields = CommitteeFields {
                    committee_id,
                    name: require(take(&mut map, "name"), "name")?,
                    sector_id: take(&mut map, "sector_id"),
                    extra: map,
                };
                Ok(RecordFields::Committee(fields))
            }
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            RecordFields::Standard(_) => EntityType::Standard,
            RecordFields::Certifier(_) => EntityType::Certifier,
            RecordFields::EvaluationCenter(_) => EntityType::EvaluationCenter,
            RecordFields::Sector(_) => EntityType::Sector,
            RecordFields::Committee(_) => EntityType::Committee,
        }
    }

    /// The natural key identifying this record at the source.
    pub fn natural_key(&self) -> &str {
        match self {
            RecordFields::Standard(f) => &f.code,
            RecordFields::Certifier(f) => &f.key,
            RecordFields::EvaluationCenter(f) => &f.key,
            RecordFields::Sector(f) => &f.sector_id,
            RecordFields::Committee(f) => &f.committee_id,
        }
    }

    /// Flatten back to the canonical field map used for fingerprinting
    /// and sink delivery. Empty optionals are omitted.
    pub fn field_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self {
            RecordFields::Standard(f) => {
                put(&mut map, "code", &f.code);
                put(&mut map, "title", &f.title);
                opt(&mut map, "sector", &f.sector);
                opt(&mut map, "committee", &f.committee);
                opt(&mut map, "level", &f.level);
                opt(&mut map, "purpose", &f.purpose);
                opt(&mut map, "published", &f.published);
                map.extend(f.extra.clone());
            }
            RecordFields::Certifier(f) => {
                put(&mut map, "key", &f.key);
                put(&mut map, "name", &f.name);
                opt(&mut map, "contact", &f.contact);
                opt(&mut map, "phone", &f.phone);
                opt(&mut map, "email", &f.email);
                opt(&mut map, "state_code", &f.state_code);
                opt(&mut map, "address", &f.address);
                map.extend(f.extra.clone());
            }
            RecordFields::EvaluationCenter(f) => {
                put(&mut map, "key", &f.key);
                put(&mut map, "name", &f.name);
                opt(&mut map, "phone", &f.phone);
                opt(&mut map, "email", &f.email);
                opt(&mut map, "state_code", &f.state_code);
                opt(&mut map, "address", &f.address);
                map.extend(f.extra.clone());
            }
            RecordFields::Sector(f) => {
                put(&mut map, "sector_id", &f.sector_id);
                put(&mut map, "name", &f.name);
                map.extend(f.extra.clone());
            }
            RecordFields::Committee(f) => {
                put(&mut map, "committee_id", &f.committee_id);
                put(&mut map, "name", &f.name);
                opt(&mut map, "sector_id", &f.sector_id);
                map.extend(f.extra.clone());
            }
        }
        map
    }
}

fn put(map: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_string(), value.to_string());
    }
}

fn opt(map: &mut BTreeMap<String, String>, key: &str, value: &Option<String>) {
    if let Some(v) = value
        && !v.is_empty()
    {
        map.insert(key.to_string(), v.clone());
    }
}

/// A fully extracted, fingerprinted record ready for the persistence sink.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedRecord {
    pub entity_type: EntityType,
    pub natural_key: String,
    pub fields: RecordFields,
    pub content_hash: String,
    pub source_url: String,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractedRecord {
    pub fn new(fields: RecordFields, source_url: &Url) -> Self {
        let content_hash = fingerprint_fields(&fields.field_map());
        Self {
            entity_type: fields.entity_type(),
            natural_key: fields.natural_key().to_string(),
            fields,
            content_hash,
            source_url: source_url.to_string(),
            extracted_at: Utc::now(),
        }
    }

    /// Same record with a caller-supplied timestamp, so relationship
    /// records extracted from one page can share it.
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.extracted_at = at;
        self
    }
}

/// Relationship predicates between harvested entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Predicate {
    Accredits,
    Evaluates,
    BelongsTo,
    IssuedBy,
}

impl Predicate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::Accredits => "accredits",
            Predicate::Evaluates => "evaluates",
            Predicate::BelongsTo => "belongs-to",
            Predicate::IssuedBy => "issued-by",
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A page-local relationship between two entities.
#[derive(Debug, Clone, Serialize)]
pub struct RelationshipRecord {
    pub subject_type: EntityType,
    pub subject_id: String,
    pub predicate: Predicate,
    pub object_type: EntityType,
    pub object_id: String,
    pub attributes: BTreeMap<String, String>,
    pub extracted_at: DateTime<Utc>,
}

impl RelationshipRecord {
    pub fn new(
        subject_type: EntityType,
        subject_id: impl Into<String>,
        predicate: Predicate,
        object_type: EntityType,
        object_id: impl Into<String>,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_type,
            subject_id: subject_id.into(),
            predicate,
            object_type,
            object_id: object_id.into(),
            attributes: BTreeMap::new(),
            extracted_at,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Immutable data carried from a listing-page match to its detail-page
/// request. The detail phase merges these fields instead of re-fetching
/// the listing; listing values fill gaps, detail values win on conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub entity_type: EntityType,
    pub listing_url: Url,
    pub fields: BTreeMap<String, String>,
}

impl Continuation {
    pub fn new(entity_type: EntityType, listing_url: Url) -> Self {
        Self {
            entity_type,
            listing_url,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.fields.insert(key.into(), value);
        }
        self
    }

    /// Merge into a detail-page field map: only fills keys the detail
    /// page did not provide.
    pub fn merge_into(&self, detail: &mut BTreeMap<String, String>) {
        for (key, value) in &self.fields {
            detail
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_entity_type_roundtrip() {
        for entity in [
            EntityType::Standard,
            EntityType::Certifier,
            EntityType::EvaluationCenter,
            EntityType::Sector,
            EntityType::Committee,
        ] {
            let parsed: EntityType = entity.as_str().parse().unwrap();
            assert_eq!(parsed, entity);
        }
    }

    #[test]
    fn test_standard_code_pattern() {
        assert!(is_valid_standard_code("EC0217"));
        assert!(is_valid_standard_code("EC0001"));
        assert!(!is_valid_standard_code("0217"));
        assert!(!is_valid_standard_code("EC217"));
        assert!(!is_valid_standard_code("EC02177"));
        assert!(!is_valid_standard_code("XX0217"));
        assert!(!is_valid_standard_code("EC021A"));
    }

    #[test]
    fn test_standard_from_map_valid() {
        let title = "Impartición de cursos de formación presencial";
        assert_eq!(title.chars().count(), 45);
        let fields = RecordFields::from_map(
            EntityType::Standard,
            map(&[("code", "EC0217"), ("title", title), ("sector", "Educación")]),
        )
        .unwrap();
        assert_eq!(fields.natural_key(), "EC0217");
        match &fields {
            RecordFields::Standard(s) => assert_eq!(s.sector.as_deref(), Some("Educación")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_standard_bare_digit_code_fails() {
        let err = RecordFields::from_map(
            EntityType::Standard,
            map(&[("code", "0217"), ("title", "A perfectly fine title")]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AppError::ValidationError { field, .. } if field == "code"
        ));
    }

    #[test]
    fn test_standard_title_out_of_range_fails() {
        let err = RecordFields::from_map(
            EntityType::Standard,
            map(&[("code", "EC0217"), ("title", "ab")]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AppError::ValidationError { field, .. } if field == "title"
        ));
    }

    #[test]
    fn test_unknown_keys_preserved_in_extra() {
        let fields = RecordFields::from_map(
            EntityType::Certifier,
            map(&[
                ("key", "ECE001-99"),
                ("name", "Instituto Nacional"),
                ("website", "https://ece.example.mx"),
            ]),
        )
        .unwrap();
        match &fields {
            RecordFields::Certifier(c) => {
                assert_eq!(
                    c.extra.get("website").map(String::as_str),
                    Some("https://ece.example.mx")
                );
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        // And the extra key survives the round trip into the field map.
        assert!(fields.field_map().contains_key("website"));
    }

    #[test]
    fn test_field_map_omits_empty_optionals() {
        let fields = RecordFields::from_map(
            EntityType::EvaluationCenter,
            map(&[("key", "CE0001-13"), ("name", "Centro Uno")]),
        )
        .unwrap();
        let flat = fields.field_map();
        assert_eq!(flat.len(), 2);
        assert!(!flat.contains_key("phone"));
    }

    #[test]
    fn test_record_fingerprint_ignores_timestamp() {
        let url = Url::parse("https://portal.example.mx/detail?id=EC0217").unwrap();
        let make = || {
            let fields = RecordFields::from_map(
                EntityType::Standard,
                map(&[("code", "EC0217"), ("title", "A perfectly fine title")]),
            )
            .unwrap();
            ExtractedRecord::new(fields, &url)
        };
        let a = make();
        let b = make();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_continuation_fills_gaps_detail_wins() {
        let listing_url = Url::parse("https://portal.example.mx/list").unwrap();
        let cont = Continuation::new(EntityType::Standard, listing_url)
            .with_field("title", "Listing title")
            .with_field("sector", "Educación");

        let mut detail = map(&[("code", "EC0217"), ("title", "Detail title wins")]);
        cont.merge_into(&mut detail);

        assert_eq!(detail.get("title").unwrap(), "Detail title wins");
        assert_eq!(detail.get("sector").unwrap(), "Educación");
    }

    #[test]
    fn test_continuation_drops_empty_values() {
        let listing_url = Url::parse("https://portal.example.mx/list").unwrap();
        let cont = Continuation::new(EntityType::Standard, listing_url).with_field("title", "");
        assert!(cont.fields.is_empty());
    }
}
