// ⚙️ Configuration - TOML file plus environment overrides
//
// Lookup order for the file: --config flag, CUSTOMER_DEDUP_CONFIG, then
// ./customer-dedup.toml. A `.env` file is read first when present.

use crate::deduplication::{DeduplicationEngine, MatchConfig};
use crate::grouping::{GroupBuilder, GroupConfig};
use crate::normalize::PhoneRegion;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_ENV: &str = "CUSTOMER_DEDUP_CONFIG";
pub const DATABASE_ENV: &str = "CUSTOMER_DEDUP_DB";
pub const DEFAULT_CONFIG_FILE: &str = "customer-dedup.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,

    /// How long a merge waits for another connection's write lock.
    /// 0 reports the conflict immediately.
    pub busy_timeout_ms: u64,

    /// Scoring threads for detection runs
    pub workers: usize,

    pub region: PhoneRegion,
    pub matching: MatchConfig,
    pub grouping: GroupConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: PathBuf::from("customers.db"),
            busy_timeout_ms: 0,
            workers: 1,
            region: PhoneRegion::default(),
            matching: MatchConfig::default(),
            grouping: GroupConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration for the CLI.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match named {
            Some(path) => Self::from_file(&path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)?
                } else {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_overrides(env::var(DATABASE_ENV).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, database_path: Option<String>) {
        if let Some(path) = database_path.filter(|p| !p.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn engine(&self) -> DeduplicationEngine {
        DeduplicationEngine::with_config(self.matching.clone(), self.region.clone())
            .with_workers(self.workers)
    }

    pub fn group_builder(&self) -> GroupBuilder {
        GroupBuilder::with_config(self.grouping.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_all_defaults() {
        assert_eq!(AppConfig::from_toml_str("").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            database_path = "/var/lib/crm/customers.db"
            workers = 4

            [region]
            country_code = "61"

            [matching]
            phone_exact_weight = 45.0
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/var/lib/crm/customers.db"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.region.country_code, "61");
        assert_eq!(config.region.trunk_prefix, "0");
        assert_eq!(config.matching.phone_exact_weight, 45.0);
        assert_eq!(config.matching.email_exact_weight, 50.0);
        assert_eq!(config.grouping, GroupConfig::default());
        assert_eq!(config.busy_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(AppConfig::from_toml_str("workers = \"many\"").is_err());
    }

    #[test]
    fn test_database_override() {
        let mut config = AppConfig::default();
        config.apply_overrides(Some("  ".to_string()));
        assert_eq!(config.database_path, PathBuf::from("customers.db"));

        config.apply_overrides(Some("other.db".to_string()));
        assert_eq!(config.database_path, PathBuf::from("other.db"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "busy_timeout_ms = 250").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));

        assert!(AppConfig::from_file(Path::new("/nonexistent/dedup.toml")).is_err());
    }

    #[test]
    fn test_engine_uses_configured_workers() {
        let config = AppConfig {
            workers: 3,
            ..Default::default()
        };
        assert_eq!(config.engine().workers, 3);
    }
}
