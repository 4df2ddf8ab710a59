// End-to-end duplicate workflow against a file database:
// import -> detect -> ignore / merge -> detect again

use chrono::{TimeZone, Utc};
use customer_dedup::db::{add_file, add_note, child_counts, insert_customer_record};
use customer_dedup::{
    get_all_customers, get_customer, get_ignored_pairs, import_customers, load_csv, merge_history,
    open_database, AppConfig, CustomerId, CustomerStatus, DedupError, MergeExecutor, MergeLocks,
    NewCustomer, PhoneRegion,
};
use rusqlite::Connection;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Connection {
    open_database(&dir.path().join("customers.db"), Duration::ZERO).unwrap()
}

/// John Smith (#30) and Jon Smith (#31) share a phone written two ways
fn seed_scenario(conn: &Connection) {
    insert_customer_record(
        conn,
        &NewCustomer::new("John", "Smith").with_mobile("+64211234567"),
        &PhoneRegion::default(),
        Some(CustomerId(30)),
        Utc.with_ymd_and_hms(2023, 1, 10, 9, 0, 0).unwrap(),
    )
    .unwrap();
    insert_customer_record(
        conn,
        &NewCustomer::new("Jon", "Smith")
            .with_mobile("021 123 4567")
            .with_email("jon.smith@example.com")
            .with_address("12 Ponsonby Rd", "Ponsonby", "Auckland", "1011"),
        &PhoneRegion::default(),
        Some(CustomerId(31)),
        Utc.with_ymd_and_hms(2024, 6, 2, 14, 30, 0).unwrap(),
    )
    .unwrap();
    insert_customer_record(
        conn,
        &NewCustomer::new("Aroha", "Ngata").with_email("aroha@example.co.nz"),
        &PhoneRegion::default(),
        Some(CustomerId(40)),
        Utc.with_ymd_and_hms(2023, 3, 1, 8, 0, 0).unwrap(),
    )
    .unwrap();
}

fn detect(conn: &Connection) -> Vec<customer_dedup::DuplicateGroup> {
    let config = AppConfig::default();
    let records = get_all_customers(conn).unwrap();
    let ignored = get_ignored_pairs(conn).unwrap();
    config
        .group_builder()
        .detect(&config.engine(), &records, &ignored)
}

#[test]
fn test_scenario_detected_as_one_group() {
    let dir = TempDir::new().unwrap();
    let conn = open(&dir);
    seed_scenario(&conn);

    let groups = detect(&conn);
    assert_eq!(groups.len(), 1);

    let group = &groups[0];
    assert_eq!(group.primary_id, CustomerId(30));
    assert_eq!(group.member_ids(), vec![CustomerId(31)]);

    let member = &group.members[0];
    assert!(member.confidence >= 60.0, "confidence was {}", member.confidence);
    assert!(member.reasons.iter().any(|r| r == "same phone"));
    assert!(member.reasons.iter().any(|r| r.contains("similar name")));
}

#[test]
fn test_ignored_pair_excluded_from_next_run() {
    let dir = TempDir::new().unwrap();
    let conn = open(&dir);
    seed_scenario(&conn);
    let executor = MergeExecutor::new();

    assert!(executor
        .ignore_pair(&conn, CustomerId(31), CustomerId(30), "op-1")
        .unwrap());
    assert!(detect(&conn).is_empty());

    // Survives reopening the database
    drop(conn);
    let conn = open(&dir);
    assert!(detect(&conn).is_empty());
    assert!(get_customer(&conn, CustomerId(31)).unwrap().is_active());
}

#[test]
fn test_merge_resolves_group() {
    let dir = TempDir::new().unwrap();
    let mut conn = open(&dir);
    seed_scenario(&conn);
    add_file(&conn, CustomerId(31), "scans/licence.png", "Driver licence").unwrap();
    add_note(&conn, CustomerId(31), "Called about invoice").unwrap();

    let record = MergeExecutor::new()
        .merge(&mut conn, CustomerId(30), CustomerId(31), "op-1")
        .unwrap();
    assert_eq!(record.snapshot.moved_files.len(), 1);

    let primary = get_customer(&conn, CustomerId(30)).unwrap();
    assert_eq!(primary.first_name, "John");
    assert_eq!(primary.mobile, "+64211234567");
    assert_eq!(primary.email, "jon.smith@example.com");
    assert_eq!(primary.postcode, "1011");
    assert_eq!(child_counts(&conn, CustomerId(30)).unwrap().total(), 2);

    let merged = get_customer(&conn, CustomerId(31)).unwrap();
    assert_eq!(merged.status, CustomerStatus::MergedInto(CustomerId(30)));

    // Merged records never appear in detection
    assert!(detect(&conn).is_empty());
    assert_eq!(merge_history(&conn, CustomerId(30)).unwrap(), vec![record]);

    let err = MergeExecutor::new()
        .merge(&mut conn, CustomerId(30), CustomerId(31), "op-2")
        .unwrap_err();
    assert!(matches!(err, DedupError::AlreadyMerged { .. }));
}

#[test]
fn test_write_lock_held_elsewhere_is_a_conflict() {
    let dir = TempDir::new().unwrap();
    let mut conn = open(&dir);
    seed_scenario(&conn);

    let blocker = open(&dir);
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let err = MergeExecutor::new()
        .merge(&mut conn, CustomerId(30), CustomerId(31), "op-1")
        .unwrap_err();
    assert!(matches!(err, DedupError::ConcurrentMergeConflict(_)));

    blocker.execute_batch("ROLLBACK").unwrap();
    assert!(get_customer(&conn, CustomerId(31)).unwrap().is_active());

    MergeExecutor::new()
        .merge(&mut conn, CustomerId(30), CustomerId(31), "op-1")
        .unwrap();
}

#[test]
fn test_shared_locks_across_threads() {
    let dir = TempDir::new().unwrap();
    let conn = open(&dir);
    seed_scenario(&conn);
    drop(conn);

    let locks = Arc::new(MergeLocks::new());
    let path = dir.path().join("customers.db");

    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let path = path.clone();
                scope.spawn(move || {
                    let mut conn = open_database(&path, Duration::from_secs(5)).unwrap();
                    MergeExecutor::with_locks(locks).merge(
                        &mut conn,
                        CustomerId(30),
                        CustomerId(31),
                        &format!("op-{}", i),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Exactly one merge wins; the rest see a conflict or a finished merge
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    for outcome in outcomes.iter().filter_map(|r| r.as_ref().err()) {
        assert!(outcome.is_recoverable(), "unexpected error: {}", outcome);
    }

    let conn = open(&dir);
    assert_eq!(merge_history(&conn, CustomerId(31)).unwrap().len(), 1);
}

#[test]
fn test_csv_import_then_detect() {
    let dir = TempDir::new().unwrap();
    let conn = open(&dir);

    let csv_path = dir.path().join("customers.csv");
    let mut file = std::fs::File::create(&csv_path).unwrap();
    writeln!(file, "first_name,last_name,email,mobile,city").unwrap();
    writeln!(file, "Mere,Parata,mere@example.com,027 555 0101,Wellington").unwrap();
    writeln!(file, "Mere,Parata,mere@Example.com,,").unwrap();
    writeln!(file, "Tom,Baker,tom@example.com,029 888 1234,Nelson").unwrap();
    drop(file);

    let customers = load_csv(&csv_path).unwrap();
    let config = AppConfig::default();

    let first = import_customers(&conn, &customers, &config.region, "import").unwrap();
    assert_eq!(first.inserted, 3);

    let second = import_customers(&conn, &customers, &config.region, "import").unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates_found, 3);

    let groups = detect(&conn);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].size(), 2);
    assert!(groups[0].members[0].reasons.iter().any(|r| r == "same email"));
}
