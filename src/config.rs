use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::database::DatabaseOptions;
use crate::error::{LakeError, LakeResult};
use crate::storage::{Compression, Format};

/// One read-back query shown in the report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReportQuery {
    pub title: String,
    pub filter: Option<String>,
}

impl ReportQuery {
    pub fn new(title: &str, filter: Option<&str>) -> Self {
        Self { title: title.to_string(), filter: filter.map(str::to_string) }
    }
}

pub fn default_reports() -> Vec<ReportQuery> {
    vec![
        ReportQuery::new("Data in the table:", None),
        ReportQuery::new("Querying the table for category_1:", Some("category = 'category_1'")),
        ReportQuery::new("Querying the table for value < 20:", Some("value < 20")),
    ]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    pub record_count: usize,
    pub table_name: String,
    pub cluster_columns: Vec<String>,
    pub category_cardinality: usize,
    pub seed: Option<u64>,
    pub display_limit: usize,
    pub rows_per_part: usize,
    pub warehouse: Option<PathBuf>,
    pub format: Format,
    pub compression: Option<Compression>,
    pub stage_timeout_secs: u64,
    pub merge_retries: u32,
    pub drop_table_after: bool,
    pub reports: Vec<ReportQuery>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            record_count: 10_000,
            table_name: "default.my_delta_lake_liquid_clustered_table".to_string(),
            cluster_columns: vec!["value".to_string()],
            category_cardinality: 10,
            seed: None,
            display_limit: 10,
            rows_per_part: 1000,
            warehouse: None,
            format: Format::Parquet,
            compression: Some(Compression::Snappy),
            stage_timeout_secs: 300,
            merge_retries: 3,
            drop_table_after: false,
            reports: default_reports(),
        }
    }
}

impl DemoConfig {
    pub fn from_file(path: &Path) -> LakeResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LakeError::InvalidArgument(format!("cannot read config {}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| LakeError::InvalidArgument(format!("invalid config {}: {e}", path.display())))
    }

    pub fn validate(&self) -> LakeResult<()> {
        let positive = [
            ("record_count", self.record_count),
            ("category_cardinality", self.category_cardinality),
            ("display_limit", self.display_limit),
            ("rows_per_part", self.rows_per_part),
        ];
        for (name, v) in positive {
            if v == 0 {
                return Err(LakeError::InvalidArgument(format!("{name} must be positive")));
            }
        }
        if self.stage_timeout_secs == 0 {
            return Err(LakeError::InvalidArgument("stage_timeout_secs must be positive".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.cluster_columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(LakeError::InvalidArgument(format!("clustering column {dup} listed twice")));
        }
        if self.format == Format::Ipc && self.compression == Some(Compression::Snappy) {
            return Err(LakeError::InvalidArgument("snappy compression is only available for parquet".to_string()));
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            warehouse: self.warehouse.clone(),
            format: self.format,
            compression: self.compression,
            rows_per_part: self.rows_per_part,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Liquid clustering demo: create, merge and query a clustered table", long_about = None)]
pub struct CliArgs {
    /// JSON config file, applied before the flags below.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of synthetic rows.
    #[arg(long)]
    pub record_count: Option<usize>,

    /// Fully qualified table name.
    #[arg(long)]
    pub table_name: Option<String>,

    /// Clustering columns, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub cluster_by: Option<Vec<String>>,

    /// Number of distinct category labels.
    #[arg(long)]
    pub categories: Option<usize>,

    /// Seed for repeatable data.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Rows shown per query.
    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub rows_per_part: Option<usize>,

    /// Directory to persist tables in; tables stay in memory without it.
    #[arg(long)]
    pub warehouse: Option<PathBuf>,

    /// parquet or ipc
    #[arg(long)]
    pub format: Option<String>,

    /// snappy, zstd or lz4
    #[arg(long)]
    pub compression: Option<String>,

    #[arg(long)]
    pub stage_timeout_secs: Option<u64>,

    /// Retries for a merge that hits a concurrent commit.
    #[arg(long)]
    pub merge_retries: Option<u32>,

    /// Drop the table once the report is printed.
    #[arg(long)]
    pub drop_after: bool,
}

impl CliArgs {
    pub fn into_config(self) -> LakeResult<DemoConfig> {
        let mut config = match &self.config {
            Some(path) => DemoConfig::from_file(path)?,
            None => DemoConfig::default(),
        };
        if let Some(v) = self.record_count { config.record_count = v; }
        if let Some(v) = self.table_name { config.table_name = v; }
        if let Some(v) = self.cluster_by { config.cluster_columns = v; }
        if let Some(v) = self.categories { config.category_cardinality = v; }
        if let Some(v) = self.seed { config.seed = Some(v); }
        if let Some(v) = self.limit { config.display_limit = v; }
        if let Some(v) = self.rows_per_part { config.rows_per_part = v; }
        if let Some(v) = self.warehouse { config.warehouse = Some(v); }
        if let Some(v) = self.format { config.format = v.parse()?; }
        if let Some(v) = self.compression { config.compression = Some(v.parse()?); }
        if let Some(v) = self.stage_timeout_secs { config.stage_timeout_secs = v; }
        if let Some(v) = self.merge_retries { config.merge_retries = v; }
        if self.drop_after { config.drop_table_after = true; }
        config.validate()?;
        Ok(config)
    }
}
