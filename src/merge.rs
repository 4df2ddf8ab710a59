// 🔀 Merge Executor - fold a duplicate customer into its primary
//
// One merge = one SQLite transaction:
//   1. fill empty primary fields from the duplicate (never overwrite)
//   2. move files, notes and custom field values to the primary
//   3. mark the duplicate MergedInto(primary)
//   4. write one immutable MergeRecord
// Any failure rolls the whole thing back.

use crate::customer::{CustomerField, CustomerId, CustomerRecord, CustomerStatus, NewCustomer};
use crate::db::{
    compute_idempotency_hash, get_customer, insert_event, insert_ignored_pair, parse_timestamp,
    Event,
};
use crate::error::{DedupError, Result};
use crate::normalize::PhoneRegion;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// MERGE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: CustomerField,
    pub before: String,
    pub after: String,
}

/// What a merge changed, enough to explain it after the fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSnapshot {
    pub primary_before: CustomerRecord,
    pub duplicate_before: CustomerRecord,

    /// Primary fields that were empty and took the duplicate's value
    pub filled_fields: Vec<FieldChange>,

    pub moved_files: Vec<i64>,
    pub moved_notes: Vec<i64>,

    /// Custom field value rows re-pointed at the primary
    pub moved_custom_values: Vec<i64>,

    /// Custom field ids whose empty primary value took the duplicate's value
    pub filled_custom_fields: Vec<i64>,

    /// Custom field ids where both had a value; the duplicate's row stays
    /// on the merged record
    pub retained_custom_fields: Vec<i64>,
}

/// Permanent audit entry, one per executed merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub merge_id: String,
    pub primary_id: CustomerId,
    pub merged_id: CustomerId,
    pub operator_id: String,
    pub merged_at: DateTime<Utc>,
    pub snapshot: MergeSnapshot,
}

fn insert_merge_record(conn: &Connection, record: &MergeRecord) -> Result<()> {
    let snapshot = serde_json::to_string(&record.snapshot)?;
    conn.execute(
        "INSERT INTO merge_records (merge_id, primary_id, merged_id, operator_id, merged_at, snapshot)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.merge_id,
            record.primary_id.0,
            record.merged_id.0,
            record.operator_id,
            record.merged_at.to_rfc3339(),
            snapshot,
        ],
    )?;
    Ok(())
}

/// Merges a customer took part in, as primary or as the absorbed record
pub fn merge_history(conn: &Connection, customer_id: CustomerId) -> Result<Vec<MergeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT merge_id, primary_id, merged_id, operator_id, merged_at, snapshot
         FROM merge_records
         WHERE primary_id = ?1 OR merged_id = ?1
         ORDER BY merged_at, id",
    )?;

    let records = stmt
        .query_map(params![customer_id.0], |row| {
            let merged_at: String = row.get(4)?;
            let snapshot: String = row.get(5)?;
            Ok(MergeRecord {
                merge_id: row.get(0)?,
                primary_id: CustomerId(row.get(1)?),
                merged_id: CustomerId(row.get(2)?),
                operator_id: row.get(3)?,
                merged_at: parse_timestamp(4, &merged_at)?,
                snapshot: serde_json::from_str(&snapshot).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

// ============================================================================
// MERGE LOCKS
// ============================================================================

/// Customers currently being merged. Shared between executors so two merges
/// touching the same record never interleave.
#[derive(Debug, Default)]
pub struct MergeLocks {
    held: Mutex<HashSet<CustomerId>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every id or none. Fails fast on the first id already held.
    pub fn try_acquire(&self, ids: &[CustomerId]) -> Result<MergeGuard<'_>> {
        let mut held = self.held.lock();

        if let Some(busy) = ids.iter().find(|id| held.contains(id)) {
            return Err(DedupError::ConcurrentMergeConflict(*busy));
        }

        held.extend(ids.iter().copied());
        Ok(MergeGuard {
            locks: self,
            ids: ids.to_vec(),
        })
    }

    pub fn is_locked(&self, id: CustomerId) -> bool {
        self.held.lock().contains(&id)
    }
}

/// Releases its ids on drop
pub struct MergeGuard<'a> {
    locks: &'a MergeLocks,
    ids: Vec<CustomerId>,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for id in &self.ids {
            held.remove(id);
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED mean another connection holds the write lock
fn conflict_or_database(err: rusqlite::Error, id: CustomerId) -> DedupError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            DedupError::ConcurrentMergeConflict(id)
        }
        _ => DedupError::Database(err),
    }
}

fn reassignment_failure(detail: String) -> impl FnOnce(rusqlite::Error) -> DedupError {
    move |source| DedupError::ChildReassignmentFailure { detail, source }
}

// ============================================================================
// MERGE EXECUTOR
// ============================================================================

pub struct MergeExecutor {
    locks: Arc<MergeLocks>,

    /// Region for the primary's recomputed idempotency hash
    region: PhoneRegion,
}

impl MergeExecutor {
    pub fn new() -> Self {
        Self::with_locks(Arc::new(MergeLocks::new()))
    }

    /// Share one lock registry between executors on different connections
    pub fn with_locks(locks: Arc<MergeLocks>) -> Self {
        MergeExecutor {
            locks,
            region: PhoneRegion::default(),
        }
    }

    pub fn with_region(mut self, region: PhoneRegion) -> Self {
        self.region = region;
        self
    }

    pub fn locks(&self) -> &Arc<MergeLocks> {
        &self.locks
    }

    /// Merge `duplicate_id` into `primary_id` atomically
    pub fn merge(
        &self,
        conn: &mut Connection,
        primary_id: CustomerId,
        duplicate_id: CustomerId,
        operator_id: &str,
    ) -> Result<MergeRecord> {
        if primary_id == duplicate_id {
            return Err(DedupError::InvalidMerge(format!(
                "cannot merge customer {} into itself",
                primary_id
            )));
        }

        let _guard = self.locks.try_acquire(&[primary_id, duplicate_id]).map_err(|e| {
            warn!(primary = %primary_id, duplicate = %duplicate_id, "Merge blocked by a concurrent merge");
            e
        })?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| conflict_or_database(e, duplicate_id))?;

        let primary = get_customer(&tx, primary_id)?;
        let duplicate = get_customer(&tx, duplicate_id)?;

        if let CustomerStatus::MergedInto(into) = duplicate.status {
            return Err(DedupError::AlreadyMerged {
                duplicate: duplicate_id,
                primary: into,
            });
        }
        if let CustomerStatus::MergedInto(into) = primary.status {
            return Err(DedupError::InvalidMerge(format!(
                "primary {} was itself merged into {}",
                primary_id, into
            )));
        }

        let now = Utc::now();

        // Status first so the duplicate no longer counts as active while the
        // primary takes over its values
        let (status, merged_into) = CustomerStatus::MergedInto(primary_id).to_columns();
        let updated = tx.execute(
            "UPDATE customers
             SET status = ?1, merged_into = ?2, version = version + 1, updated_at = ?3
             WHERE id = ?4 AND version = ?5",
            params![status, merged_into, now.to_rfc3339(), duplicate_id.0, duplicate.version],
        )?;
        if updated == 0 {
            return Err(DedupError::ConcurrentMergeConflict(duplicate_id));
        }

        let filled_fields = fill_gaps(&tx, &primary, &duplicate, &self.region, now)?;
        let children = reassign_children(&tx, primary_id, duplicate_id)?;

        let record = MergeRecord {
            merge_id: uuid::Uuid::new_v4().to_string(),
            primary_id,
            merged_id: duplicate_id,
            operator_id: operator_id.to_string(),
            merged_at: now,
            snapshot: MergeSnapshot {
                primary_before: primary,
                duplicate_before: duplicate,
                filled_fields,
                moved_files: children.files,
                moved_notes: children.notes,
                moved_custom_values: children.moved_custom_values,
                filled_custom_fields: children.filled_custom_fields,
                retained_custom_fields: children.retained_custom_fields,
            },
        };
        insert_merge_record(&tx, &record)?;

        let event = Event::new(
            "customer_merged",
            "customer",
            &duplicate_id.to_string(),
            serde_json::json!({
                "merge_id": record.merge_id,
                "primary_id": primary_id,
                "filled_fields": record.snapshot.filled_fields.len(),
                "moved_files": record.snapshot.moved_files.len(),
                "moved_notes": record.snapshot.moved_notes.len(),
            }),
            operator_id,
        );
        insert_event(&tx, &event)?;

        tx.commit().map_err(|e| conflict_or_database(e, duplicate_id))?;

        info!(
            primary = %primary_id,
            duplicate = %duplicate_id,
            operator = operator_id,
            merge_id = %record.merge_id,
            "Customer merge committed"
        );
        Ok(record)
    }

    /// Sequential single merges; each succeeds or fails on its own
    pub fn merge_many(
        &self,
        conn: &mut Connection,
        primary_id: CustomerId,
        duplicate_ids: &[CustomerId],
        operator_id: &str,
    ) -> Vec<(CustomerId, Result<MergeRecord>)> {
        duplicate_ids
            .iter()
            .map(|&duplicate_id| {
                let result = self.merge(conn, primary_id, duplicate_id, operator_id);
                if let Err(e) = &result {
                    warn!(primary = %primary_id, duplicate = %duplicate_id, error = %e, "Merge failed");
                }
                (duplicate_id, result)
            })
            .collect()
    }

    /// Mark a pair as "not a duplicate" so future detection runs skip it.
    /// Returns false when the pair was already ignored. The pair row and its
    /// audit event commit together.
    pub fn ignore_pair(
        &self,
        conn: &Connection,
        a: CustomerId,
        b: CustomerId,
        operator_id: &str,
    ) -> Result<bool> {
        if a == b {
            return Err(DedupError::InvalidMerge(format!(
                "cannot ignore customer {} against itself",
                a
            )));
        }

        let tx = conn.unchecked_transaction()?;
        get_customer(&tx, a)?;
        get_customer(&tx, b)?;

        let inserted = insert_ignored_pair(&tx, a, b, operator_id)?;
        if inserted {
            let event = Event::new(
                "pair_ignored",
                "customer_pair",
                &format!("{}:{}", a.0.min(b.0), a.0.max(b.0)),
                serde_json::json!({ "customer_a": a, "customer_b": b }),
                operator_id,
            );
            insert_event(&tx, &event)?;
        }
        tx.commit()?;

        if inserted {
            info!(customer_a = %a, customer_b = %b, operator = operator_id, "Pair ignored");
        }
        Ok(inserted)
    }
}

impl Default for MergeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MERGE STEPS
// ============================================================================

/// Copy values the primary lacks and store the merged contact data's
/// idempotency hash, so a later import of that data is recognised.
fn fill_gaps(
    conn: &Connection,
    primary: &CustomerRecord,
    duplicate: &CustomerRecord,
    region: &PhoneRegion,
    now: DateTime<Utc>,
) -> Result<Vec<FieldChange>> {
    let mut merged = primary.clone();
    let mut changes = Vec::new();

    for field in CustomerField::ALL {
        if !primary.has_value(field) && duplicate.has_value(field) {
            let value = duplicate.field(field).to_string();
            changes.push(FieldChange {
                field,
                before: primary.field(field).to_string(),
                after: value.clone(),
            });
            merged.set_field(field, value);
        }
    }

    let hash = compute_idempotency_hash(&NewCustomer::from(&merged), region);

    // Version bump even without field changes: the children moved
    let updated = conn.execute(
        "UPDATE customers
         SET first_name = ?1, last_name = ?2, email = ?3, mobile = ?4,
             street_address = ?5, suburb = ?6, city = ?7, postcode = ?8,
             idempotency_hash = ?9, version = version + 1, updated_at = ?10
         WHERE id = ?11 AND version = ?12",
        params![
            merged.first_name,
            merged.last_name,
            merged.email,
            merged.mobile,
            merged.street_address,
            merged.suburb,
            merged.city,
            merged.postcode,
            hash,
            now.to_rfc3339(),
            primary.id.0,
            primary.version,
        ],
    )?;
    if updated == 0 {
        return Err(DedupError::ConcurrentMergeConflict(primary.id));
    }

    Ok(changes)
}

#[derive(Debug, Default)]
struct MovedChildren {
    files: Vec<i64>,
    notes: Vec<i64>,
    moved_custom_values: Vec<i64>,
    filled_custom_fields: Vec<i64>,
    retained_custom_fields: Vec<i64>,
}

fn child_ids(conn: &Connection, table: &str, owner: CustomerId) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE customer_id = ?1 ORDER BY id",
        table
    ))?;
    let ids = stmt
        .query_map(params![owner.0], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn reassign_children(
    conn: &Connection,
    primary_id: CustomerId,
    duplicate_id: CustomerId,
) -> Result<MovedChildren> {
    let mut moved = MovedChildren::default();

    for (table, slot) in [
        ("customer_files", &mut moved.files),
        ("customer_notes", &mut moved.notes),
    ] {
        let detail = || format!("{} of customer {}", table, duplicate_id);
        *slot = child_ids(conn, table, duplicate_id).map_err(reassignment_failure(detail()))?;
        conn.execute(
            &format!("UPDATE {} SET customer_id = ?1 WHERE customer_id = ?2", table),
            params![primary_id.0, duplicate_id.0],
        )
        .map_err(reassignment_failure(detail()))?;
    }

    let detail = format!("custom field values of customer {}", duplicate_id);
    let load_values = |owner: CustomerId| -> rusqlite::Result<Vec<(i64, i64, String)>> {
        let mut stmt = conn.prepare(
            "SELECT id, custom_field_id, value FROM customer_custom_field_values
             WHERE customer_id = ?1 ORDER BY custom_field_id",
        )?;
        let rows = stmt
            .query_map(params![owner.0], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    };

    let primary_values: HashMap<i64, (i64, String)> = load_values(primary_id)
        .map_err(reassignment_failure(detail.clone()))?
        .into_iter()
        .map(|(id, field_id, value)| (field_id, (id, value)))
        .collect();
    let duplicate_values = load_values(duplicate_id).map_err(reassignment_failure(detail.clone()))?;

    for (row_id, field_id, value) in duplicate_values {
        match primary_values.get(&field_id) {
            None => {
                conn.execute(
                    "UPDATE customer_custom_field_values SET customer_id = ?1 WHERE id = ?2",
                    params![primary_id.0, row_id],
                )
                .map_err(reassignment_failure(detail.clone()))?;
                moved.moved_custom_values.push(row_id);
            }
            Some((primary_row, primary_value))
                if primary_value.trim().is_empty() && !value.trim().is_empty() =>
            {
                conn.execute(
                    "UPDATE customer_custom_field_values SET value = ?1 WHERE id = ?2",
                    params![value, primary_row],
                )
                .map_err(reassignment_failure(detail.clone()))?;
                moved.filled_custom_fields.push(field_id);
                moved.retained_custom_fields.push(field_id);
            }
            Some(_) => moved.retained_custom_fields.push(field_id),
        }
    }

    Ok(moved)
}

// ============================================================================
// TESTS
// ============================================================================
