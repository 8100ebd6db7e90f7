//! Field normalization applied by every driver before validation.
//!
//! The portal's markup carries copy-paste artifacts (non-breaking and
//! zero-width spaces), phone numbers in half a dozen local formats, and
//! state names spelled however the data-entry clerk felt that day. The
//! policy here: clean whitespace aggressively, rewrite only phone shapes
//! we positively recognize, and resolve regions against a fixed table —
//! an unmapped region is logged and left blank, never guessed.

/// Collapse whitespace runs and strip zero-width / non-breaking artifacts.
pub fn clean_text(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .filter_map(|c| match c {
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => None,
            '\u{00A0}' => Some(' '),
            other => Some(other),
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrite a recognized national phone number to international form.
///
/// - 10 digits: bare national number, prefixed with the country code.
/// - 12 digits starting `52` / 13 digits starting `521`: already carries
///   the country code, normalized to `+` + digits.
///
/// Anything else is passed through unchanged.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => format!("+52{digits}"),
        12 if digits.starts_with("52") => format!("+{digits}"),
        13 if digits.starts_with("521") => format!("+{digits}"),
        _ => raw.to_string(),
    }
}

/// Fixed state table: INEGI two-digit code, canonical (accent-stripped,
/// uppercase) name.
const STATES: &[(&str, &str)] = &[
    ("01", "AGUASCALIENTES"),
    ("02", "BAJA CALIFORNIA"),
    ("03", "BAJA CALIFORNIA SUR"),
    ("04", "CAMPECHE"),
    ("05", "COAHUILA"),
    ("06", "COLIMA"),
    ("07", "CHIAPAS"),
    ("08", "CHIHUAHUA"),
    ("09", "CIUDAD DE MEXICO"),
    ("10", "DURANGO"),
    ("11", "GUANAJUATO"),
    ("12", "GUERRERO"),
    ("13", "HIDALGO"),
    ("14", "JALISCO"),
    ("15", "MEXICO"),
    ("16", "MICHOACAN"),
    ("17", "MORELOS"),
    ("18", "NAYARIT"),
    ("19", "NUEVO LEON"),
    ("20", "OAXACA"),
    ("21", "PUEBLA"),
    ("22", "QUERETARO"),
    ("23", "QUINTANA ROO"),
    ("24", "SAN LUIS POTOSI"),
    ("25", "SINALOA"),
    ("26", "SONORA"),
    ("27", "TABASCO"),
    ("28", "TAMAULIPAS"),
    ("29", "TLAXCALA"),
    ("30", "VERACRUZ"),
    ("31", "YUCATAN"),
    ("32", "ZACATECAS"),
];

/// Shorthand spellings seen in the wild, resolved before the main table.
const ALIASES: &[(&str, &str)] = &[
    ("CDMX", "09"),
    ("DF", "09"),
    ("D F", "09"),
    ("DISTRITO FEDERAL", "09"),
    ("EDOMEX", "15"),
    ("EDO MEX", "15"),
];

/// Administrative prefixes stripped for the second resolution pass.
const PREFIXES: &[&str] = &["ESTADO DE ", "EDO DE ", "GOBIERNO DE ", "GOBIERNO DEL "];

/// Uppercase and strip accents for table comparison.
fn lookup_key(raw: &str) -> String {
    clean_text(raw)
        .chars()
        .filter_map(|c| match c {
            'á' | 'à' | 'Á' | 'À' => Some('A'),
            'é' | 'è' | 'É' | 'È' => Some('E'),
            'í' | 'ì' | 'Í' | 'Ì' => Some('I'),
            'ó' | 'ò' | 'Ó' | 'Ò' => Some('O'),
            'ú' | 'ù' | 'ü' | 'Ú' | 'Ù' | 'Ü' => Some('U'),
            'ñ' | 'Ñ' => Some('N'),
            '.' | ',' => None,
            other => Some(other.to_ascii_uppercase()),
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve a region/state name to its fixed two-digit code.
///
/// Resolution order: alias table, exact match, prefix-stripped match,
/// substring match. Returns `None` (and logs) for anything unmapped.
pub fn resolve_region(raw: &str) -> Option<&'static str> {
    let key = lookup_key(raw);
    if key.is_empty() {
        return None;
    }

    if let Some((_, code)) = ALIASES.iter().find(|(alias, _)| *alias == key) {
        return Some(code);
    }

    if let Some((code, _)) = STATES.iter().find(|(_, name)| *name == key) {
        return Some(code);
    }

    for prefix in PREFIXES {
        if let Some(stripped) = key.strip_prefix(prefix)
            && let Some((code, _)) = STATES.iter().find(|(_, name)| *name == stripped)
        {
            return Some(code);
        }
    }

    // Substring pass catches decorated values like "MONTERREY, NUEVO LEON".
    // Longer names first so "BAJA CALIFORNIA SUR" is not shadowed by
    // "BAJA CALIFORNIA".
    let mut by_len: Vec<&(&str, &str)> = STATES.iter().collect();
    by_len.sort_by_key(|(_, name)| std::cmp::Reverse(name.len()));
    if let Some((code, _)) = by_len.iter().find(|(_, name)| key.contains(name)) {
        return Some(code);
    }

    tracing::warn!(region = %raw, "Unmapped region name, leaving blank");
    None
}
