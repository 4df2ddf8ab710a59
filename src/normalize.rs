// 🧹 Field Normalizer - canonical comparable forms for phone, email, name
//
// Malformed input never fails: it degrades to a best-effort form or the
// empty sentinel so one bad record cannot abort a detection run.

use crate::customer::{CustomerId, CustomerRecord};
use crate::error::{DedupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// FIELD KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Phone,
    Email,
    Name,
}

impl FromStr for FieldKind {
    type Err = DedupError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "phone" | "mobile" => Ok(FieldKind::Phone),
            "email" => Ok(FieldKind::Email),
            "name" => Ok(FieldKind::Name),
            _ => Err(DedupError::InvalidFieldKind(tag.to_string())),
        }
    }
}

// ============================================================================
// PHONE REGION
// ============================================================================

/// Dialling conventions used to canonicalise phone numbers.
/// Defaults to New Zealand: trunk `0`, country code `64`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneRegion {
    /// Digits dialled before an area code inside the country
    pub trunk_prefix: String,

    /// Country calling code, without `+`
    pub country_code: String,

    /// Digits dialled to reach an international number (replaces `+`)
    pub international_prefix: String,

    /// Shortest canonical number accepted. Anything shorter (a bare country
    /// code, a lone trunk digit) is a placeholder and becomes `""`.
    pub min_digits: usize,
}

impl Default for PhoneRegion {
    fn default() -> Self {
        PhoneRegion {
            trunk_prefix: "0".to_string(),
            country_code: "64".to_string(),
            international_prefix: "00".to_string(),
            min_digits: 7,
        }
    }
}

// ============================================================================
// NORMALIZERS
// ============================================================================

/// Normalize a value whose kind arrives as a string tag (form field types,
/// config files). Only an unknown tag is an error.
pub fn normalize_field(tag: &str, raw: &str, region: &PhoneRegion) -> Result<String> {
    let kind = FieldKind::from_str(tag)?;
    Ok(normalize(kind, raw, region))
}

pub fn normalize(kind: FieldKind, raw: &str, region: &PhoneRegion) -> String {
    match kind {
        FieldKind::Phone => normalize_phone(raw, region),
        FieldKind::Email => normalize_email(raw),
        FieldKind::Name => normalize_name(raw),
    }
}

/// Digits only, in international form without `+`.
///
/// "0211234567", "+64 21 123 4567" and "0064211234567" all become
/// "64211234567". Anything after an extension marker is dropped, and
/// placeholders such as "+64" or "0" become the empty sentinel.
pub fn normalize_phone(raw: &str, region: &PhoneRegion) -> String {
    let mut digits = String::with_capacity(raw.len());

    for ch in raw.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if matches!(ch, 'x' | 'X' | '#' | ';' | ',') && !digits.is_empty() {
            break;
        }
    }

    if digits.is_empty() {
        return String::new();
    }

    let intl = region.international_prefix.as_str();
    let trunk = region.trunk_prefix.as_str();

    let canonical = if !intl.is_empty() && digits.starts_with(intl) {
        // Country codes never start with zero
        digits[intl.len()..].trim_start_matches('0').to_string()
    } else if !trunk.is_empty() && digits.starts_with(trunk) {
        format!("{}{}", region.country_code, &digits[trunk.len()..])
    } else {
        digits
    };

    if canonical.len() < region.min_digits {
        return String::new();
    }
    canonical
}

/// Lower-cased, trimmed, inner whitespace collapsed. Diacritics are kept.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lower-cases the domain only; the local part may be case-significant.
pub fn normalize_email(raw: &str) -> String {
    let trimmed = raw.trim();

    match trimmed.rfind('@') {
        Some(at) => {
            let (local, domain) = trimmed.split_at(at);
            format!("{}{}", local, domain.to_lowercase())
        }
        None => trimmed.to_string(),
    }
}

// ============================================================================
// NORMALIZED VIEW
// ============================================================================

/// Matching view of a customer, computed once per detection run
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCustomer {
    pub id: CustomerId,
    pub created_at: DateTime<Utc>,
    pub phone: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
}

impl NormalizedCustomer {
    pub fn from_record(record: &CustomerRecord, region: &PhoneRegion) -> Self {
        let first_name = normalize_name(&record.first_name);
        let last_name = normalize_name(&record.last_name);
        let full_name = normalize_name(&format!("{} {}", first_name, last_name));

        NormalizedCustomer {
            id: record.id,
            created_at: record.created_at,
            phone: normalize_phone(&record.mobile, region),
            email: normalize_email(&record.email),
            first_name,
            last_name,
            full_name,
        }
    }

    pub fn has_name_parts(&self) -> bool {
        !self.first_name.is_empty() && !self.last_name.is_empty()
    }

    // Similarity rules only compare values that share a leading character,
    // so these double as exact blocking keys.

    pub fn last_initial(&self) -> Option<char> {
        self.last_name.chars().next()
    }

    pub fn full_initial(&self) -> Option<char> {
        self.full_name.chars().next()
    }

    pub fn email_initial(&self) -> Option<char> {
        self.email.to_lowercase().chars().next()
    }
}
