// 🗄️ Storage - SQLite schema and accessors for customers and their children
// Customers, files, notes, custom fields, ignored pairs, audit events

use crate::customer::{
    ChildCounts, CustomField, CustomFieldType, CustomFieldValue, CustomerFile, CustomerId,
    CustomerNote, CustomerRecord, CustomerStatus, FileType, NewCustomer,
};
use crate::deduplication::{pair_key, PairKey};
use crate::error::{DedupError, Result};
use crate::normalize::{normalize_email, normalize_name, normalize_phone, PhoneRegion};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Event for audit trail ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Open (or create) a database file and make sure the schema exists
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Customers
    // A merged customer keeps its row and points at its primary
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS customers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            mobile TEXT NOT NULL DEFAULT '',
            street_address TEXT NOT NULL DEFAULT '',
            suburb TEXT NOT NULL DEFAULT '',
            city TEXT NOT NULL DEFAULT '',
            postcode TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            merged_into INTEGER REFERENCES customers(id),
            version INTEGER NOT NULL DEFAULT 1,
            idempotency_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (
                (status = 'active' AND merged_into IS NULL)
                OR (status = 'merged' AND merged_into IS NOT NULL AND merged_into <> id)
            )
        )",
        [],
    )?;

    // ==========================================================================
    // Child records
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS customer_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            path TEXT NOT NULL,
            file_type TEXT NOT NULL DEFAULT 'other',
            description TEXT NOT NULL DEFAULT '',
            uploaded_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS customer_notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS custom_fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            label TEXT NOT NULL,
            field_type TEXT NOT NULL,
            options TEXT NOT NULL DEFAULT '',
            is_required INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS customer_custom_field_values (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            custom_field_id INTEGER NOT NULL REFERENCES custom_fields(id),
            value TEXT NOT NULL DEFAULT '',
            UNIQUE (customer_id, custom_field_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Duplicate workflow
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ignored_pairs (
            customer_a INTEGER NOT NULL REFERENCES customers(id),
            customer_b INTEGER NOT NULL REFERENCES customers(id),
            operator_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (customer_a, customer_b),
            CHECK (customer_a < customer_b)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            merge_id TEXT UNIQUE NOT NULL,
            primary_id INTEGER NOT NULL REFERENCES customers(id),
            merged_id INTEGER NOT NULL REFERENCES customers(id),
            operator_id TEXT NOT NULL,
            merged_at TEXT NOT NULL,
            snapshot TEXT NOT NULL
        )",
        [],
    )?;

    // Merge records are a permanent ledger
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS merge_records_no_update
         BEFORE UPDATE ON merge_records
         BEGIN SELECT RAISE(ABORT, 'merge records are immutable'); END;

         CREATE TRIGGER IF NOT EXISTS merge_records_no_delete
         BEFORE DELETE ON merge_records
         BEGIN SELECT RAISE(ABORT, 'merge records are immutable'); END;",
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_customers_status ON customers(status);
         CREATE INDEX IF NOT EXISTS idx_customers_hash ON customers(idempotency_hash);
         CREATE INDEX IF NOT EXISTS idx_files_customer ON customer_files(customer_id);
         CREATE INDEX IF NOT EXISTS idx_notes_customer ON customer_notes(customer_id);
         CREATE INDEX IF NOT EXISTS idx_merge_primary ON merge_records(primary_id);
         CREATE INDEX IF NOT EXISTS idx_merge_merged ON merge_records(merged_id);
         CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
         CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

pub(crate) const CUSTOMER_COLUMNS: &str = "id, first_name, last_name, email, mobile, \
     street_address, suburb, city, postcode, status, merged_into, version, created_at, updated_at";

pub(crate) fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn customer_from_row(row: &Row) -> rusqlite::Result<CustomerRecord> {
    let status_str: String = row.get(9)?;
    let merged_into: Option<i64> = row.get(10)?;
    let status = CustomerStatus::from_columns(&status_str, merged_into).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            Type::Text,
            format!("invalid status '{}' / merged_into {:?}", status_str, merged_into).into(),
        )
    })?;

    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(CustomerRecord {
        id: CustomerId(row.get(0)?),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        mobile: row.get(4)?,
        street_address: row.get(5)?,
        suburb: row.get(6)?,
        city: row.get(7)?,
        postcode: row.get(8)?,
        status,
        version: row.get(11)?,
        created_at: parse_timestamp(12, &created_at)?,
        updated_at: parse_timestamp(13, &updated_at)?,
    })
}

// ============================================================================
// CUSTOMERS
// ============================================================================

/// Idempotency hash for imports.
/// NOTE: This is for DEDUPLICATION of import rows, not IDENTITY.
pub fn compute_idempotency_hash(customer: &NewCustomer, region: &PhoneRegion) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}",
        normalize_email(&customer.email).to_lowercase(),
        normalize_phone(&customer.mobile, region),
        normalize_name(&customer.first_name),
        normalize_name(&customer.last_name),
    ));
    format!("{:x}", hasher.finalize())
}

/// Insert with the default phone region
pub fn insert_customer(conn: &Connection, customer: &NewCustomer) -> Result<CustomerRecord> {
    insert_customer_record(conn, customer, &PhoneRegion::default(), None, Utc::now())
}

/// Insert with an explicit id and creation time (imports, fixtures). The
/// idempotency hash uses `region`, the same one CSV import checks against.
pub fn insert_customer_record(
    conn: &Connection,
    customer: &NewCustomer,
    region: &PhoneRegion,
    id: Option<CustomerId>,
    created_at: DateTime<Utc>,
) -> Result<CustomerRecord> {
    let hash = compute_idempotency_hash(customer, region);
    insert_row(conn, customer, id, created_at, &hash)
}

fn insert_row(
    conn: &Connection,
    customer: &NewCustomer,
    id: Option<CustomerId>,
    created_at: DateTime<Utc>,
    hash: &str,
) -> Result<CustomerRecord> {
    let created = created_at.to_rfc3339();
    let (status, merged_into) = CustomerStatus::Active.to_columns();

    conn.execute(
        "INSERT INTO customers (
            id, first_name, last_name, email, mobile,
            street_address, suburb, city, postcode,
            status, merged_into, version, idempotency_hash, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?13, ?13)",
        params![
            id.map(|i| i.0),
            customer.first_name,
            customer.last_name,
            customer.email,
            customer.mobile,
            customer.street_address,
            customer.suburb,
            customer.city,
            customer.postcode,
            status,
            merged_into,
            hash,
            created,
        ],
    )?;

    let new_id = CustomerId(conn.last_insert_rowid());
    get_customer(conn, new_id)
}

pub fn find_customer(conn: &Connection, id: CustomerId) -> Result<Option<CustomerRecord>> {
    let sql = format!("SELECT {} FROM customers WHERE id = ?1", CUSTOMER_COLUMNS);
    let record = conn
        .query_row(&sql, params![id.0], customer_from_row)
        .optional()?;
    Ok(record)
}

pub fn get_customer(conn: &Connection, id: CustomerId) -> Result<CustomerRecord> {
    find_customer(conn, id)?.ok_or(DedupError::NotFound(id))
}

/// Read accessor for detection: every active customer
pub fn get_active_customers(conn: &Connection) -> Result<Vec<CustomerRecord>> {
    let sql = format!(
        "SELECT {} FROM customers WHERE status = 'active' ORDER BY id",
        CUSTOMER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let customers = stmt
        .query_map([], customer_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(customers)
}

pub fn get_all_customers(conn: &Connection) -> Result<Vec<CustomerRecord>> {
    let sql = format!("SELECT {} FROM customers ORDER BY id", CUSTOMER_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let customers = stmt
        .query_map([], customer_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(customers)
}

pub fn count_customers(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM customers", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// CHILD RECORDS
// ============================================================================

pub fn add_file(
    conn: &Connection,
    customer_id: CustomerId,
    path: &str,
    description: &str,
) -> Result<CustomerFile> {
    let file_type = FileType::detect(path);
    let uploaded_at = Utc::now();

    conn.execute(
        "INSERT INTO customer_files (customer_id, path, file_type, description, uploaded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            customer_id.0,
            path,
            file_type.as_str(),
            description,
            uploaded_at.to_rfc3339()
        ],
    )?;

    Ok(CustomerFile {
        id: conn.last_insert_rowid(),
        customer_id,
        path: path.to_string(),
        file_type,
        description: description.to_string(),
        uploaded_at,
    })
}

pub fn get_files(conn: &Connection, customer_id: CustomerId) -> Result<Vec<CustomerFile>> {
    let mut stmt = conn.prepare(
        "SELECT id, customer_id, path, file_type, description, uploaded_at
         FROM customer_files WHERE customer_id = ?1 ORDER BY uploaded_at DESC, id DESC",
    )?;
    let files = stmt
        .query_map(params![customer_id.0], |row| {
            let file_type: String = row.get(3)?;
            let uploaded_at: String = row.get(5)?;
            Ok(CustomerFile {
                id: row.get(0)?,
                customer_id: CustomerId(row.get(1)?),
                path: row.get(2)?,
                file_type: FileType::parse(&file_type),
                description: row.get(4)?,
                uploaded_at: parse_timestamp(5, &uploaded_at)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(files)
}

pub fn add_note(conn: &Connection, customer_id: CustomerId, body: &str) -> Result<CustomerNote> {
    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO customer_notes (customer_id, body, created_at) VALUES (?1, ?2, ?3)",
        params![customer_id.0, body, created_at.to_rfc3339()],
    )?;

    Ok(CustomerNote {
        id: conn.last_insert_rowid(),
        customer_id,
        body: body.to_string(),
        created_at,
    })
}

pub fn get_notes(conn: &Connection, customer_id: CustomerId) -> Result<Vec<CustomerNote>> {
    let mut stmt = conn.prepare(
        "SELECT id, customer_id, body, created_at
         FROM customer_notes WHERE customer_id = ?1 ORDER BY created_at, id",
    )?;
    let notes = stmt
        .query_map(params![customer_id.0], |row| {
            let created_at: String = row.get(3)?;
            Ok(CustomerNote {
                id: row.get(0)?,
                customer_id: CustomerId(row.get(1)?),
                body: row.get(2)?,
                created_at: parse_timestamp(3, &created_at)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(notes)
}

pub fn create_custom_field(
    conn: &Connection,
    name: &str,
    label: &str,
    field_type: CustomFieldType,
    options: &str,
    is_required: bool,
) -> Result<CustomField> {
    conn.execute(
        "INSERT INTO custom_fields (name, label, field_type, options, is_required, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        params![name, label, field_type.as_str(), options, is_required],
    )?;

    Ok(CustomField {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        label: label.to_string(),
        field_type,
        options: options.to_string(),
        is_required,
        is_active: true,
    })
}

/// Insert or replace the value of one custom field for one customer
pub fn set_custom_field_value(
    conn: &Connection,
    customer_id: CustomerId,
    custom_field_id: i64,
    value: &str,
) -> Result<CustomFieldValue> {
    conn.execute(
        "INSERT INTO customer_custom_field_values (customer_id, custom_field_id, value)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (customer_id, custom_field_id) DO UPDATE SET value = excluded.value",
        params![customer_id.0, custom_field_id, value],
    )?;

    let id: i64 = conn.query_row(
        "SELECT id FROM customer_custom_field_values
         WHERE customer_id = ?1 AND custom_field_id = ?2",
        params![customer_id.0, custom_field_id],
        |row| row.get(0),
    )?;

    Ok(CustomFieldValue {
        id,
        customer_id,
        custom_field_id,
        value: value.to_string(),
    })
}

pub fn get_custom_field_values(
    conn: &Connection,
    customer_id: CustomerId,
) -> Result<Vec<CustomFieldValue>> {
    let mut stmt = conn.prepare(
        "SELECT id, customer_id, custom_field_id, value
         FROM customer_custom_field_values WHERE customer_id = ?1 ORDER BY custom_field_id",
    )?;
    let values = stmt
        .query_map(params![customer_id.0], |row| {
            Ok(CustomFieldValue {
                id: row.get(0)?,
                customer_id: CustomerId(row.get(1)?),
                custom_field_id: row.get(2)?,
                value: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(values)
}

pub fn child_counts(conn: &Connection, customer_id: CustomerId) -> Result<ChildCounts> {
    let count = |table: &str| -> rusqlite::Result<i64> {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE customer_id = ?1", table),
            params![customer_id.0],
            |row| row.get(0),
        )
    };

    Ok(ChildCounts {
        files: count("customer_files")?,
        notes: count("customer_notes")?,
        custom_field_values: count("customer_custom_field_values")?,
    })
}

// ============================================================================
// IGNORED PAIRS
// ============================================================================

/// Record that two customers are not duplicates. Returns false when the
/// pair was already suppressed.
pub fn insert_ignored_pair(
    conn: &Connection,
    a: CustomerId,
    b: CustomerId,
    operator_id: &str,
) -> Result<bool> {
    let (lo, hi) = pair_key(a, b);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO ignored_pairs (customer_a, customer_b, operator_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![lo.0, hi.0, operator_id, Utc::now().to_rfc3339()],
    )?;
    Ok(inserted > 0)
}

pub fn get_ignored_pairs(conn: &Connection) -> Result<HashSet<PairKey>> {
    let mut stmt = conn.prepare("SELECT customer_a, customer_b FROM ignored_pairs")?;
    let pairs = stmt
        .query_map([], |row| {
            Ok((CustomerId(row.get(0)?), CustomerId(row.get(1)?)))
        })?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(pairs)
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}

// ============================================================================
// CSV IMPORT
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub duplicates_found: usize,
}

pub fn load_csv(csv_path: &Path) -> anyhow::Result<Vec<NewCustomer>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut customers = Vec::new();
    for result in rdr.deserialize() {
        let customer: NewCustomer = result.context("Failed to deserialize customer row")?;
        customers.push(customer);
    }

    Ok(customers)
}

/// Insert customers, skipping rows whose idempotency hash already exists
pub fn import_customers(
    conn: &Connection,
    customers: &[NewCustomer],
    region: &PhoneRegion,
    actor: &str,
) -> anyhow::Result<ImportReport> {
    let mut report = ImportReport::default();

    for customer in customers {
        let hash = compute_idempotency_hash(customer, region);

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM customers WHERE idempotency_hash = ?1)",
            params![hash],
            |row| row.get(0),
        )?;
        if exists {
            debug!(email = %customer.email, "Skipping duplicate import row");
            report.duplicates_found += 1;
            continue;
        }

        let record = insert_row(conn, customer, None, Utc::now(), &hash)
            .with_context(|| format!("Failed to insert {} {}", customer.first_name, customer.last_name))?;
        report.inserted += 1;

        let event = Event::new(
            "customer_imported",
            "customer",
            &record.id.to_string(),
            serde_json::json!({ "hash": hash }),
            actor,
        );
        insert_event(conn, &event)?;
    }

    info!(
        inserted = report.inserted,
        duplicates_found = report.duplicates_found,
        "Customer import complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_and_get_customer() {
        let conn = test_db();
        let new = NewCustomer::new("John", "Smith")
            .with_email("john@example.com")
            .with_mobile("0211234567");

        let record = insert_customer(&conn, &new).unwrap();
        let loaded = get_customer(&conn, record.id).unwrap();

        assert_eq!(loaded, record);
        assert_eq!(loaded.status, CustomerStatus::Active);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_get_missing_customer() {
        let conn = test_db();
        let err = get_customer(&conn, CustomerId(404)).unwrap_err();
        assert!(matches!(err, DedupError::NotFound(CustomerId(404))));
    }

    #[test]
    fn test_status_check_constraint() {
        let conn = test_db();
        let record = insert_customer(&conn, &NewCustomer::new("A", "B")).unwrap();

        // Merged flag without a back-reference is rejected
        let result = conn.execute(
            "UPDATE customers SET status = 'merged' WHERE id = ?1",
            params![record.id.0],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_active_customers_excludes_merged() {
        let conn = test_db();
        let a = insert_customer(&conn, &NewCustomer::new("A", "One")).unwrap();
        let b = insert_customer(&conn, &NewCustomer::new("B", "Two")).unwrap();

        conn.execute(
            "UPDATE customers SET status = 'merged', merged_into = ?1 WHERE id = ?2",
            params![a.id.0, b.id.0],
        )
        .unwrap();

        let active = get_active_customers(&conn).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        assert_eq!(count_customers(&conn).unwrap(), 2);
    }

    #[test]
    fn test_child_records_and_counts() {
        let conn = test_db();
        let c = insert_customer(&conn, &NewCustomer::new("A", "B")).unwrap();

        let file = add_file(&conn, c.id, "contracts/quote.pdf", "Signed quote").unwrap();
        assert_eq!(file.file_type, FileType::Document);
        add_note(&conn, c.id, "Called about invoice").unwrap();

        let field = create_custom_field(&conn, "source", "Lead source", CustomFieldType::Select, "Web,Referral", false).unwrap();
        set_custom_field_value(&conn, c.id, field.id, "Web").unwrap();
        set_custom_field_value(&conn, c.id, field.id, "Referral").unwrap();

        let values = get_custom_field_values(&conn, c.id).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, "Referral");

        assert_eq!(
            child_counts(&conn, c.id).unwrap(),
            ChildCounts {
                files: 1,
                notes: 1,
                custom_field_values: 1
            }
        );
        assert_eq!(get_files(&conn, c.id).unwrap()[0].path, "contracts/quote.pdf");
        assert_eq!(get_notes(&conn, c.id).unwrap()[0].body, "Called about invoice");
    }

    #[test]
    fn test_ignored_pairs_are_order_independent() {
        let conn = test_db();
        let a = insert_customer(&conn, &NewCustomer::new("A", "One")).unwrap();
        let b = insert_customer(&conn, &NewCustomer::new("B", "Two")).unwrap();

        assert!(insert_ignored_pair(&conn, b.id, a.id, "op-1").unwrap());
        assert!(!insert_ignored_pair(&conn, a.id, b.id, "op-1").unwrap());

        let pairs = get_ignored_pairs(&conn).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs.contains(&(a.id, b.id)));
    }

    #[test]
    fn test_event_log() {
        let conn = test_db();

        let event = Event::new(
            "test_event",
            "customer",
            "test_id_123",
            serde_json::json!({"test": "data"}),
            "test_actor",
        );
        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "customer", "test_id_123").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "test_event");
        assert_eq!(events[0].actor, "test_actor");
    }

    #[test]
    fn test_idempotency_hash_ignores_formatting() {
        let region = PhoneRegion::default();
        let a = NewCustomer::new("John", "Smith")
            .with_email("John@Example.com")
            .with_mobile("021 123 4567");
        let b = NewCustomer::new(" john ", "SMITH")
            .with_email("john@example.com")
            .with_mobile("+64211234567");

        let hash = compute_idempotency_hash(&a, &region);
        assert_eq!(hash, compute_idempotency_hash(&b, &region));
        assert_eq!(hash.len(), 64, "SHA-256 hash should be 64 hex characters");
    }

    #[test]
    fn test_csv_import_skips_duplicates() {
        let conn = test_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("customers.csv");

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "first_name,last_name,email,mobile,street_address,suburb,city,postcode").unwrap();
        writeln!(file, "John,Smith,john@example.com,0211234567,1 Queen St,CBD,Auckland,1010").unwrap();
        writeln!(file, "Jane,Doe,jane@example.com,0271112222,,,,").unwrap();
        writeln!(file, "john,smith,john@EXAMPLE.com,+64211234567,,,,").unwrap();
        drop(file);

        let rows = load_csv(&path).unwrap();
        assert_eq!(rows.len(), 3);

        let report = import_customers(&conn, &rows, &PhoneRegion::default(), "csv_importer").unwrap();
        assert_eq!(report, ImportReport { inserted: 2, duplicates_found: 1 });

        // Importing again inserts nothing
        let again = import_customers(&conn, &rows, &PhoneRegion::default(), "csv_importer").unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(count_customers(&conn).unwrap(), 2);
    }

    #[test]
    fn test_manual_insert_hash_uses_given_region() {
        let conn = test_db();
        let us = PhoneRegion {
            trunk_prefix: "1".to_string(),
            country_code: "1".to_string(),
            international_prefix: "011".to_string(),
            min_digits: 7,
        };
        let row = NewCustomer::new("Dana", "Reyes").with_mobile("0211234567");

        insert_customer_record(&conn, &row, &us, None, Utc::now()).unwrap();

        let same_region = import_customers(&conn, &[row.clone()], &us, "import").unwrap();
        assert_eq!(same_region, ImportReport { inserted: 0, duplicates_found: 1 });

        // The default region canonicalises the number differently
        let other_region = import_customers(&conn, &[row], &PhoneRegion::default(), "import").unwrap();
        assert_eq!(other_region.inserted, 1);
    }
}
