// 👤 Customer Entity - identity, contact fields, lifecycle status
// Plus the child records a customer owns (files, notes, custom field values)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTITY
// ============================================================================

/// Stable customer identity (the store's row id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(pub i64);

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Lifecycle of a customer record. A merged record is never deleted, it
/// keeps pointing at the record that absorbed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "primary", rename_all = "snake_case")]
pub enum CustomerStatus {
    Active,
    MergedInto(CustomerId),
}

impl CustomerStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, CustomerStatus::Active)
    }

    /// Column pair `(status, merged_into)` as stored in SQLite
    pub fn to_columns(&self) -> (&'static str, Option<i64>) {
        match self {
            CustomerStatus::Active => ("active", None),
            CustomerStatus::MergedInto(primary) => ("merged", Some(primary.0)),
        }
    }

    /// Inverse of `to_columns`. Returns None for combinations the schema
    /// CHECK constraint forbids.
    pub fn from_columns(status: &str, merged_into: Option<i64>) -> Option<Self> {
        match (status, merged_into) {
            ("active", None) => Some(CustomerStatus::Active),
            ("merged", Some(id)) => Some(CustomerStatus::MergedInto(CustomerId(id))),
            _ => None,
        }
    }
}

// ============================================================================
// CUSTOMER RECORD
// ============================================================================

/// Customer as persisted. Empty strings mean "no value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: CustomerId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub mobile: String,
    pub street_address: String,
    pub suburb: String,
    pub city: String,
    pub postcode: String,
    pub status: CustomerStatus,

    /// Bumped on every mutation
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerRecord {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn field(&self, field: CustomerField) -> &str {
        match field {
            CustomerField::FirstName => &self.first_name,
            CustomerField::LastName => &self.last_name,
            CustomerField::Email => &self.email,
            CustomerField::Mobile => &self.mobile,
            CustomerField::StreetAddress => &self.street_address,
            CustomerField::Suburb => &self.suburb,
            CustomerField::City => &self.city,
            CustomerField::Postcode => &self.postcode,
        }
    }

    pub fn set_field(&mut self, field: CustomerField, value: String) {
        let slot = match field {
            CustomerField::FirstName => &mut self.first_name,
            CustomerField::LastName => &mut self.last_name,
            CustomerField::Email => &mut self.email,
            CustomerField::Mobile => &mut self.mobile,
            CustomerField::StreetAddress => &mut self.street_address,
            CustomerField::Suburb => &mut self.suburb,
            CustomerField::City => &mut self.city,
            CustomerField::Postcode => &mut self.postcode,
        };
        *slot = value;
    }

    /// Whether a field holds a value (whitespace-only counts as empty)
    pub fn has_value(&self, field: CustomerField) -> bool {
        !self.field(field).trim().is_empty()
    }
}

/// Contact / identity fields that take part in fill-gaps merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerField {
    FirstName,
    LastName,
    Email,
    Mobile,
    StreetAddress,
    Suburb,
    City,
    Postcode,
}

impl CustomerField {
    pub const ALL: [CustomerField; 8] = [
        CustomerField::FirstName,
        CustomerField::LastName,
        CustomerField::Email,
        CustomerField::Mobile,
        CustomerField::StreetAddress,
        CustomerField::Suburb,
        CustomerField::City,
        CustomerField::Postcode,
    ];

    /// Column name in the `customers` table
    pub fn column(&self) -> &'static str {
        match self {
            CustomerField::FirstName => "first_name",
            CustomerField::LastName => "last_name",
            CustomerField::Email => "email",
            CustomerField::Mobile => "mobile",
            CustomerField::StreetAddress => "street_address",
            CustomerField::Suburb => "suburb",
            CustomerField::City => "city",
            CustomerField::Postcode => "postcode",
        }
    }
}

/// Input for creating a customer (CSV rows, create forms, tests)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCustomer {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub street_address: String,
    #[serde(default)]
    pub suburb: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub postcode: String,
}

impl NewCustomer {
    pub fn new(first_name: &str, last_name: &str) -> Self {
        NewCustomer {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = email.to_string();
        self
    }

    pub fn with_mobile(mut self, mobile: &str) -> Self {
        self.mobile = mobile.to_string();
        self
    }

    pub fn with_address(mut self, street: &str, suburb: &str, city: &str, postcode: &str) -> Self {
        self.street_address = street.to_string();
        self.suburb = suburb.to_string();
        self.city = city.to_string();
        self.postcode = postcode.to_string();
        self
    }

    /// Unsaved view used for create-time duplicate checks
    pub fn to_record(&self, id: CustomerId, created_at: DateTime<Utc>) -> CustomerRecord {
        CustomerRecord {
            id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            mobile: self.mobile.clone(),
            street_address: self.street_address.clone(),
            suburb: self.suburb.clone(),
            city: self.city.clone(),
            postcode: self.postcode.clone(),
            status: CustomerStatus::Active,
            version: 1,
            created_at,
            updated_at: created_at,
        }
    }
}

impl From<&CustomerRecord> for NewCustomer {
    fn from(record: &CustomerRecord) -> Self {
        NewCustomer {
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            email: record.email.clone(),
            mobile: record.mobile.clone(),
            street_address: record.street_address.clone(),
            suburb: record.suburb.clone(),
            city: record.city.clone(),
            postcode: record.postcode.clone(),
        }
    }
}

// ============================================================================
// CHILD RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Document,
    Video,
    Audio,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Document => "document",
            FileType::Video => "video",
            FileType::Audio => "audio",
            FileType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> FileType {
        match value {
            "image" => FileType::Image,
            "document" => FileType::Document,
            "video" => FileType::Video,
            "audio" => FileType::Audio,
            _ => FileType::Other,
        }
    }

    /// Guess the type from the file extension
    pub fn detect(path: &str) -> FileType {
        const IMAGE: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".webp", ".svg"];
        const VIDEO: &[&str] = &[".mp4", ".mov", ".avi", ".wmv", ".flv", ".mkv", ".webm"];
        const AUDIO: &[&str] = &[".mp3", ".wav", ".ogg", ".aac", ".flac", ".m4a"];
        const DOCUMENT: &[&str] = &[
            ".pdf", ".txt", ".md", ".log", ".csv", ".json", ".xml", ".doc", ".docx", ".xls",
            ".xlsx", ".ppt", ".pptx", ".html",
        ];

        let lower = path.to_lowercase();
        let has_ext = |exts: &[&str]| exts.iter().any(|ext| lower.ends_with(ext));

        if has_ext(IMAGE) {
            FileType::Image
        } else if has_ext(VIDEO) {
            FileType::Video
        } else if has_ext(AUDIO) {
            FileType::Audio
        } else if has_ext(DOCUMENT) {
            FileType::Document
        } else {
            FileType::Other
        }
    }
}

/// File attached to a customer. Only the reference is tracked here, the
/// bytes live in whatever file storage the application uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFile {
    pub id: i64,
    pub customer_id: CustomerId,
    pub path: String,
    pub file_type: FileType,
    pub description: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerNote {
    pub id: i64,
    pub customer_id: CustomerId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomFieldType {
    Text,
    Number,
    Email,
    Date,
    Boolean,
    Textarea,
    Select,
}

impl CustomFieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomFieldType::Text => "text",
            CustomFieldType::Number => "number",
            CustomFieldType::Email => "email",
            CustomFieldType::Date => "date",
            CustomFieldType::Boolean => "boolean",
            CustomFieldType::Textarea => "textarea",
            CustomFieldType::Select => "select",
        }
    }
}

/// Definition of an operator-defined profile field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: i64,
    pub name: String,
    pub label: String,
    pub field_type: CustomFieldType,
    /// Comma separated, dropdown fields only
    pub options: String,
    pub is_required: bool,
    pub is_active: bool,
}

/// Value of one custom field for one customer. Unique per (customer, field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub id: i64,
    pub customer_id: CustomerId,
    pub custom_field_id: i64,
    pub value: String,
}

/// How many child rows a customer owns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCounts {
    pub files: i64,
    pub notes: i64,
    pub custom_field_values: i64,
}

impl ChildCounts {
    pub fn total(&self) -> i64 {
        self.files + self.notes + self.custom_field_values
    }
}
