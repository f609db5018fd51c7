//! Pipeline configuration.
//!
//! Loaded once at startup from a TOML file and passed down as an immutable
//! value. String values of the form `env:NAME` are replaced with the
//! environment variable `NAME` while loading, so secrets never have to be
//! written into the file and are never re-read mid-run.
//!
//! ```toml
//! state_dir = ".ch-sync-state"
//!
//! [sources.app]
//! connection_string = "env:PG_URL"
//!
//! [destinations.warehouse]
//! url = "http://localhost:8123"
//! database = "analytics"
//! password = "env:CH_PASSWORD"
//!
//! [[pipelines]]
//! name = "common_tables"
//! kind = "incremental"
//! source = "app"
//! destination = "warehouse"
//! dataset = "pg"
//! tables = { users = "id", orders = "updated_at" }
//! ```

pub mod duration;

use clickhouse_sink::ClickHouseConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{Result, SyncError};

pub use duration::{parse_duration, parse_duration_to_secs};

const ENV_PREFIX: &str = "env:";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory for run history when `state = "filesystem"`
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub state: StateLocation,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub destinations: BTreeMap<String, ClickHouseConfig>,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".ch-sync-state")
}

/// Where pipeline run history is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateLocation {
    #[default]
    Filesystem,
    /// A table in the pipeline's destination database
    Destination,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub source: String,
    pub destination: String,
    /// Prefix of destination tables: `{dataset}___{table}`
    pub dataset: String,
    /// Statements run against the destination after a successful run
    #[serde(default)]
    pub post_merge_sql: Vec<String>,
    #[serde(flatten)]
    pub kind: PipelineKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineKind {
    Incremental(IncrementalConfig),
    Cdc(CdcConfig),
    LogBatch(LogBatchConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncrementalConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub tables: TableList,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rows pulled per table per run
    #[serde(default = "default_row_limit")]
    pub row_limit: u64,
}

/// Tables with their tracking columns. A plain list tracks `id`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TableList {
    Names(Vec<String>),
    Tracking(BTreeMap<String, String>),
}

impl TableList {
    /// `(table, tracking_column)` pairs.
    pub fn entries(&self) -> Vec<(String, String)> {
        match self {
            TableList::Names(names) => names
                .iter()
                .map(|t| (t.clone(), "id".to_string()))
                .collect(),
            TableList::Tracking(map) => map
                .iter()
                .map(|(t, c)| (t.clone(), c.clone()))
                .collect(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            TableList::Names(names) => names.is_empty(),
            TableList::Tracking(map) => map.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdcConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub tables: Vec<String>,
    pub streams: Vec<StreamConfig>,
    #[serde(default = "default_cdc_batch_size")]
    pub batch_size: usize,
    /// Stop streaming after this long, e.g. "10m"
    #[serde(default)]
    pub max_duration: Option<String>,
    /// Stop streaming after this many change events
    #[serde(default)]
    pub max_records: Option<u64>,
    /// Finish the run once the slot has no pending changes
    #[serde(default = "default_true")]
    pub stop_when_caught_up: bool,
    #[serde(default)]
    pub poll_interval: Option<String>,
}

impl CdcConfig {
    pub fn max_duration(&self) -> Result<Option<Duration>> {
        parse_optional_duration(self.max_duration.as_deref())
    }

    pub fn poll_interval(&self) -> Result<Option<Duration>> {
        parse_optional_duration(self.poll_interval.as_deref())
    }
}

fn parse_optional_duration(value: Option<&str>) -> Result<Option<Duration>> {
    value
        .map(|s| parse_duration(s).map_err(|e| SyncError::config(format!("{e:#}"))))
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    pub slot: String,
    pub publication: String,
    /// Destination table for transformed streams
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub transform: Transform,
    /// Only rows whose `name` column is one of these
    #[serde(default)]
    pub names: Vec<String>,
}

/// How change events are shaped before they are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Rows as they are, keyed by primary key
    #[default]
    Raw,
    /// Inline ads dispatched on the row's `name`
    InlineAds,
    /// Inline ads, always read with the legacy payload layout
    InlineAdsLegacy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogBatchConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub names: Vec<String>,
    pub target: String,
    #[serde(default = "default_watermark_column")]
    pub watermark_column: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_batch_size() -> usize {
    4000
}

fn default_cdc_batch_size() -> usize {
    1000
}

fn default_row_limit() -> u64 {
    2_000_000
}

fn default_watermark_column() -> String {
    "created_at".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Read, resolve and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        Self::parse(&text, |name| std::env::var(name).ok())
    }

    /// Parse configuration text, resolving `env:` values through `lookup`.
    pub fn parse(text: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(text)
            .map_err(|e| SyncError::config(format!("Invalid config file: {e}")))?;
        resolve_env(&mut value, &lookup)?;

        let config: Config = value
            .try_into()
            .map_err(|e| SyncError::config(format!("Invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources
            .get(name)
            .ok_or_else(|| SyncError::config(format!("Unknown source '{name}'")))
    }

    pub fn destination(&self, name: &str) -> Result<&ClickHouseConfig> {
        self.destinations
            .get(name)
            .ok_or_else(|| SyncError::config(format!("Unknown destination '{name}'")))
    }

    pub fn pipeline(&self, name: &str) -> Result<&PipelineConfig> {
        self.pipelines
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SyncError::config(format!("Unknown pipeline '{name}'")))
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut slots = HashSet::new();

        for pipeline in &self.pipelines {
            if !names.insert(pipeline.name.as_str()) {
                return Err(SyncError::config(format!(
                    "Duplicate pipeline name '{}'",
                    pipeline.name
                )));
            }
            self.source(&pipeline.source)?;
            self.destination(&pipeline.destination)?;

            match &pipeline.kind {
                PipelineKind::Incremental(c) => {
                    if c.tables.is_empty() {
                        return Err(SyncError::config(format!(
                            "Pipeline '{}' has no tables",
                            pipeline.name
                        )));
                    }
                }
                PipelineKind::Cdc(c) => {
                    if c.tables.is_empty() || c.streams.is_empty() {
                        return Err(SyncError::config(format!(
                            "Pipeline '{}' needs at least one table and one stream",
                            pipeline.name
                        )));
                    }
                    c.max_duration()?;
                    c.poll_interval()?;
                    for stream in &c.streams {
                        // A slot has a single consumer
                        if !slots.insert((pipeline.source.as_str(), stream.slot.as_str())) {
                            return Err(SyncError::config(format!(
                                "Replication slot '{}' is used by more than one stream",
                                stream.slot
                            )));
                        }
                        if stream.transform != Transform::Raw && stream.target.is_none() {
                            return Err(SyncError::config(format!(
                                "Stream on slot '{}' needs a target table",
                                stream.slot
                            )));
                        }
                    }
                }
                PipelineKind::LogBatch(c) => {
                    if c.names.is_empty() {
                        return Err(SyncError::config(format!(
                            "Pipeline '{}' has no names to select",
                            pipeline.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn resolve_env(value: &mut toml::Value, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
    match value {
        toml::Value::String(s) => {
            if let Some(name) = s.strip_prefix(ENV_PREFIX) {
                *s = lookup(name).ok_or_else(|| {
                    SyncError::config(format!("Environment variable {name} is not set"))
                })?;
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                resolve_env(item, lookup)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                resolve_env(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}
