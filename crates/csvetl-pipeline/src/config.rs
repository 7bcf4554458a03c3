//! Pipeline configuration
//!
//! Loaded from an optional YAML file, then overridden by `ETL_*` environment variables
//! (`.env` is honoured), then validated. Every section has defaults, so an empty file or no
//! file at all yields a runnable configuration apart from the target columns.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EtlError, Result};
use crate::extract::{CsvFormat, TextEncoding};
use crate::load::{PgConnectOptions, RetryPolicy};
use crate::pipeline::StorageLayout;
use crate::transform::{ColumnSpec, Extensions, RulePolicy, RuleSpec, TargetSchema, TransformSpec, Validator};
use csvetl_common::logging::{LogConfig, LogFormat, LogLevel, LogOutput};

// ============================================================================
// Defaults
// ============================================================================

/// Default input directory scanned for files.
pub const DEFAULT_INPUT_DIR: &str = "./data/input";

/// Default directory holding claimed files.
pub const DEFAULT_PROCESSING_DIR: &str = "./data/processing";

/// Default directory for successfully loaded files.
pub const DEFAULT_ARCHIVE_DIR: &str = "./data/archive";

/// Default directory for files that failed.
pub const DEFAULT_ERROR_DIR: &str = "./data/error";

/// Default glob for input file names.
pub const DEFAULT_FILE_PATTERN: &str = "*.csv";

/// Default records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Default number of concurrent file workers.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://etl_user@localhost:5432/etl_target";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default number of connection attempts at start-up.
pub const DEFAULT_DATABASE_CONNECT_ATTEMPTS: u32 = 3;

/// Default delay between connection attempts in seconds.
pub const DEFAULT_DATABASE_CONNECT_RETRY_DELAY_SECS: u64 = 5;

/// Default target table.
pub const DEFAULT_TABLE: &str = "csv_data";

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub csv: CsvConfig,
    pub processing: ProcessingConfig,
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
    pub target: TargetConfig,
    pub logging: LoggingConfig,
}

/// Input location and file format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvConfig {
    pub input_dir: PathBuf,
    pub processing_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub error_dir: PathBuf,
    pub file_pattern: String,
    pub delimiter: String,
    pub quote: String,
    pub encoding: String,
    pub has_header: bool,
    pub allow_multiline: bool,
    pub batch_size: usize,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            processing_dir: PathBuf::from(DEFAULT_PROCESSING_DIR),
            archive_dir: PathBuf::from(DEFAULT_ARCHIVE_DIR),
            error_dir: PathBuf::from(DEFAULT_ERROR_DIR),
            file_pattern: DEFAULT_FILE_PATTERN.to_string(),
            delimiter: ",".to_string(),
            quote: "\"".to_string(),
            encoding: "utf-8".to_string(),
            has_header: true,
            allow_multiline: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_workers: usize,
    pub policy: RulePolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            policy: RulePolicy::CollectAll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            connect_attempts: DEFAULT_DATABASE_CONNECT_ATTEMPTS,
            connect_retry_delay_secs: DEFAULT_DATABASE_CONNECT_RETRY_DELAY_SECS,
        }
    }
}

/// Destination table, its columns, the transformations applied and the rules records must pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub table: String,
    pub schema: Option<String>,
    pub columns: Vec<ColumnSpec>,
    pub transforms: Vec<TransformSpec>,
    pub rules: Vec<RuleSpec>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            schema: None,
            columns: Vec::new(),
            transforms: Vec::new(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    pub log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let defaults = LogConfig::default();
        Self {
            level: defaults.level,
            output: defaults.output,
            format: defaults.format,
            log_dir: defaults.log_dir,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl PipelineConfig {
    /// Load from `path` (if given), apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file; a missing file is a configuration error
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EtlError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
            .map_err(|e| EtlError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Apply `ETL_*` overrides looked up through `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("ETL_DB_URL") {
            self.database.url = url;
        }
        if let Some(dir) = lookup("ETL_CSV_INPUT_DIR") {
            self.csv.input_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("ETL_CSV_BATCH_SIZE") {
            self.csv.batch_size = parse_override("ETL_CSV_BATCH_SIZE", &size)?;
        }
        if let Some(workers) = lookup("ETL_MAX_WORKERS") {
            self.processing.max_workers = parse_override("ETL_MAX_WORKERS", &workers)?;
        }
        if let Some(level) = lookup("ETL_LOG_LEVEL") {
            self.logging.level = level
                .parse()
                .map_err(|e| EtlError::config(format!("ETL_LOG_LEVEL: {e}")))?;
        }
        Ok(self)
    }

    /// Check settings that do not depend on the file system or the database
    pub fn validate(&self) -> Result<()> {
        if self.csv.batch_size == 0 {
            return Err(EtlError::config("csv.batch_size must be greater than 0"));
        }
        if self.processing.max_workers == 0 {
            return Err(EtlError::config("processing.max_workers must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(EtlError::config("retry.max_attempts must be greater than 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(EtlError::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if self.database.url.is_empty() {
            return Err(EtlError::config("database.url cannot be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(EtlError::config("database.max_connections must be greater than 0"));
        }
        if self.target.table.trim().is_empty() {
            return Err(EtlError::config("target.table cannot be empty"));
        }
        if self.csv.file_pattern.is_empty() {
            return Err(EtlError::config("csv.file_pattern cannot be empty"));
        }

        // format and schema checks share their error messages with the conversions
        self.csv_format()?;
        self.target_schema()?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------------

    pub fn csv_format(&self) -> Result<CsvFormat> {
        let delimiter = single_byte("csv.delimiter", &self.csv.delimiter)?;
        let quote = single_byte("csv.quote", &self.csv.quote)?;
        if delimiter == quote {
            return Err(EtlError::config("csv.delimiter and csv.quote must differ"));
        }
        Ok(CsvFormat {
            delimiter,
            quote,
            encoding: self.csv.encoding.parse::<TextEncoding>()?,
            has_header: self.csv.has_header,
            allow_multiline: self.csv.allow_multiline,
        })
    }

    /// Columns read from the file; derived columns are added by `validator`
    pub fn target_schema(&self) -> Result<TargetSchema> {
        TargetSchema::new(self.target.columns.clone())
    }

    /// Compile the target schema, transformations and rules
    pub fn validator(&self, extensions: &Extensions) -> Result<Validator> {
        Validator::compile(
            self.target_schema()?,
            &self.target.transforms,
            &self.target.rules,
            extensions,
            self.processing.policy,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout {
            input_dir: self.csv.input_dir.clone(),
            processing_dir: self.csv.processing_dir.clone(),
            archive_dir: self.csv.archive_dir.clone(),
            error_dir: self.csv.error_dir.clone(),
            file_pattern: self.csv.file_pattern.clone(),
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions {
            url: self.database.url.clone(),
            max_connections: self.database.max_connections,
            connect_timeout: Duration::from_secs(self.database.connect_timeout_secs),
            connect_attempts: self.database.connect_attempts,
            retry_delay: Duration::from_secs(self.database.connect_retry_delay_secs),
        }
    }

    /// Logging settings; `LOG_*` variables are applied on top by the caller
    pub fn log_config(&self) -> LogConfig {
        LogConfig::builder()
            .level(self.logging.level)
            .output(self.logging.output)
            .format(self.logging.format)
            .log_dir(self.logging.log_dir.clone())
            .build()
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EtlError::config(format!("{key} has invalid value '{value}'")))
}

fn single_byte(key: &str, value: &str) -> Result<u8> {
    let value = match value {
        "\\t" | "tab" => "\t",
        other => other,
    };
    match value.as_bytes() {
        [b] if b.is_ascii() => Ok(*b),
        _ => Err(EtlError::config(format!(
            "{key} must be a single ASCII character, got '{value}'"
        ))),
    }
}
