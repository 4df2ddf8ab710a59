use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::info;

use customer_dedup::{
    get_active_customers, get_all_customers, get_customer, get_ignored_pairs, import_customers,
    load_csv, merge_history, open_database, AppConfig, CustomerId, DuplicateGroup,
    DuplicateSummary, MergeExecutor, MergeRecord,
};

#[derive(Parser)]
#[command(name = "customer-dedup")]
#[command(version, about = "Find and merge duplicate customer records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file
    #[arg(long, global = true, env = "CUSTOMER_DEDUP_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database (overrides the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Import customers from a CSV file
    Import {
        csv: PathBuf,

        #[arg(long, default_value = "import")]
        actor: String,
    },

    /// Scan all active customers for duplicate groups
    Detect {
        /// Print groups as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the strongest matches for one customer
    Check {
        id: i64,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Merge one or more duplicates into a primary record
    Merge {
        primary: i64,

        #[arg(required = true)]
        duplicates: Vec<i64>,

        #[arg(long)]
        operator: String,
    },

    /// Mark a pair as "not a duplicate"
    Ignore {
        a: i64,
        b: i64,

        #[arg(long)]
        operator: String,
    },

    /// Merge history of one customer
    History { id: i64 },

    /// Database and duplicate summary
    Stats,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("customer_dedup=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let mut conn = open_database(&config.database_path, config.busy_timeout())
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;

    match cli.command {
        Commands::Init => {
            info!(path = %config.database_path.display(), "Database ready");
            println!("✓ Database initialized at {}", config.database_path.display());
        }
        Commands::Import { csv, actor } => run_import(&conn, &config, &csv, &actor)?,
        Commands::Detect { json } => run_detect(&conn, &config, json)?,
        Commands::Check { id, limit } => run_check(&conn, &config, CustomerId(id), limit)?,
        Commands::Merge {
            primary,
            duplicates,
            operator,
        } => run_merge(&mut conn, &config, CustomerId(primary), &duplicates, &operator)?,
        Commands::Ignore { a, b, operator } => {
            let executor = MergeExecutor::new().with_region(config.region.clone());
            if executor.ignore_pair(&conn, CustomerId(a), CustomerId(b), &operator)? {
                println!("✓ Pair {} / {} will no longer be reported", a, b);
            } else {
                println!("Pair {} / {} was already ignored", a, b);
            }
        }
        Commands::History { id } => run_history(&conn, CustomerId(id))?,
        Commands::Stats => run_stats(&conn, &config)?,
    }

    Ok(())
}

fn run_import(conn: &Connection, config: &AppConfig, csv: &Path, actor: &str) -> Result<()> {
    println!("📂 Loading {}...", csv.display());
    let customers = load_csv(csv)?;
    println!("✓ Loaded {} rows", customers.len());

    let report = import_customers(conn, &customers, &config.region, actor)?;
    println!("✓ Inserted {} customers", report.inserted);
    if report.duplicates_found > 0 {
        println!("✓ Skipped {} rows already imported", report.duplicates_found);
    }
    Ok(())
}

fn run_detect(conn: &Connection, config: &AppConfig, json: bool) -> Result<()> {
    let records = get_all_customers(conn)?;
    let ignored = get_ignored_pairs(conn)?;
    let groups = config
        .group_builder()
        .detect(&config.engine(), &records, &ignored);

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("✓ No duplicates found among {} customers", records.len());
        return Ok(());
    }

    for group in &groups {
        print_group(conn, group)?;
    }

    let summary = DuplicateSummary::from_groups(&groups, &config.grouping);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "{} groups, {} customers (high {}, medium {}, low {})",
        summary.total_groups,
        summary.total_customers,
        summary.confidence_breakdown.high,
        summary.confidence_breakdown.medium,
        summary.confidence_breakdown.low
    );
    Ok(())
}

fn print_group(conn: &Connection, group: &DuplicateGroup) -> Result<()> {
    let primary = get_customer(conn, group.primary_id)?;
    println!(
        "\n🔍 Primary #{} {} ({:.0}%)",
        primary.id,
        primary.full_name(),
        group.max_confidence
    );

    for member in &group.members {
        let record = get_customer(conn, member.customer_id)?;
        let via = member
            .via
            .map(|v| format!(" via #{}", v))
            .unwrap_or_default();
        println!(
            "   #{} {} {:.0}%{} [{}]",
            record.id,
            record.full_name(),
            member.confidence,
            via,
            member.reasons.join(", ")
        );
    }
    Ok(())
}

fn run_check(conn: &Connection, config: &AppConfig, id: CustomerId, limit: usize) -> Result<()> {
    let candidate = get_customer(conn, id)?;
    let records = get_active_customers(conn)?;
    let matches = config.engine().matches_for(&candidate, &records, limit);

    if matches.is_empty() {
        println!("✓ No likely duplicates for #{} {}", id, candidate.full_name());
        return Ok(());
    }

    println!("Likely duplicates for #{} {}:", id, candidate.full_name());
    for m in matches {
        let Some(other_id) = m.other(id) else { continue };
        let other = get_customer(conn, other_id)?;
        println!(
            "   #{} {} {:.0}% [{}]",
            other.id,
            other.full_name(),
            m.confidence,
            m.reasons.join(", ")
        );
    }
    Ok(())
}

fn run_merge(
    conn: &mut Connection,
    config: &AppConfig,
    primary: CustomerId,
    duplicates: &[i64],
    operator: &str,
) -> Result<()> {
    let duplicates: Vec<CustomerId> = duplicates.iter().copied().map(CustomerId).collect();
    let executor = MergeExecutor::new().with_region(config.region.clone());

    let mut failed = 0;
    for (duplicate, result) in executor.merge_many(conn, primary, &duplicates, operator) {
        match result {
            Ok(record) => print_merge(&record),
            Err(e) => {
                failed += 1;
                let hint = if e.is_recoverable() {
                    " (refresh and retry)"
                } else {
                    ""
                };
                eprintln!("❌ #{} not merged: {}{}", duplicate, e, hint);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} merges failed", failed, duplicates.len());
    }
    Ok(())
}

fn print_merge(record: &MergeRecord) {
    println!(
        "✓ Merged #{} into #{} (merge {})",
        record.merged_id, record.primary_id, record.merge_id
    );
    for change in &record.snapshot.filled_fields {
        println!("   {} ← {:?}", change.field.column(), change.after);
    }
    let moved = record.snapshot.moved_files.len()
        + record.snapshot.moved_notes.len()
        + record.snapshot.moved_custom_values.len();
    if moved > 0 {
        println!("   {} child records moved", moved);
    }
    if !record.snapshot.retained_custom_fields.is_empty() {
        println!(
            "   {} custom field values kept on #{}",
            record.snapshot.retained_custom_fields.len(),
            record.merged_id
        );
    }
}

fn run_history(conn: &Connection, id: CustomerId) -> Result<()> {
    let customer = get_customer(conn, id)?;
    println!("📜 #{} {} ({:?})", id, customer.full_name(), customer.status);

    let history = merge_history(conn, id)?;
    if history.is_empty() {
        println!("   no merges");
    }
    for record in history {
        println!(
            "   {} #{} → #{} by {}",
            record.merged_at.format("%Y-%m-%d %H:%M"),
            record.merged_id,
            record.primary_id,
            record.operator_id
        );
    }
    Ok(())
}

fn run_stats(conn: &Connection, config: &AppConfig) -> Result<()> {
    let records = get_all_customers(conn)?;
    let active = records.iter().filter(|r| r.is_active()).count();
    let ignored = get_ignored_pairs(conn)?;
    let groups = config
        .group_builder()
        .detect(&config.engine(), &records, &ignored);
    let summary = DuplicateSummary::from_groups(&groups, &config.grouping);

    println!("📊 Customers: {} ({} active, {} merged)", records.len(), active, records.len() - active);
    println!("   Ignored pairs: {}", ignored.len());
    println!("   Duplicate groups: {}", summary.total_groups);
    println!("   Customers in groups: {}", summary.total_customers);
    println!(
        "   Confidence: high {} / medium {} / low {}",
        summary.confidence_breakdown.high,
        summary.confidence_breakdown.medium,
        summary.confidence_breakdown.low
    );
    Ok(())
}
