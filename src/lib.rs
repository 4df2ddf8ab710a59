// Customer Dedup - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod customer;
pub mod db;
pub mod deduplication; // Pairwise matcher
pub mod error;
pub mod grouping; // Transitive duplicate groups
pub mod merge; // Fill-gaps merge executor
pub mod normalize;

// Re-export commonly used types
pub use config::AppConfig;
pub use customer::{
    ChildCounts, CustomField, CustomFieldType, CustomFieldValue, CustomerField, CustomerFile,
    CustomerId, CustomerNote, CustomerRecord, CustomerStatus, FileType, NewCustomer,
};
pub use db::{
    get_active_customers, get_all_customers, get_customer, get_events_for_entity,
    get_ignored_pairs, import_customers, insert_customer, insert_event, load_csv, open_database,
    setup_database, Event, ImportReport,
};
pub use deduplication::{pair_key, DeduplicationEngine, MatchConfig, MatchResult, MatchRule, PairKey};
pub use error::{DedupError, Result};
pub use grouping::{
    ConfidenceBreakdown, DuplicateGroup, DuplicateSummary, GroupBuilder, GroupConfig, GroupMember,
};
pub use merge::{merge_history, FieldChange, MergeExecutor, MergeLocks, MergeRecord, MergeSnapshot};
pub use normalize::{normalize, normalize_field, FieldKind, NormalizedCustomer, PhoneRegion};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
