use polars::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::engine::{CommitInfo, MergeMetrics, MergeRequest, TableDescription, TableEngine};
use crate::error::{LakeError, LakeResult};
use crate::schema::{is_identifier, TableSpec};
use crate::storage::{Compression, DatasetStorage, Format};

pub const DEFAULT_SCHEMA: &str = "default";

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: String, name: String) -> Self {
        Self {schema, name}
    }

    /// Accepts `schema.name` or a bare `name` in the default schema.
    pub fn parse(qualified: &str) -> LakeResult<Self> {
        let parts = qualified.split('.').collect::<Vec<&str>>();
        let (schema, name) = match parts.as_slice() {
            [name] => (DEFAULT_SCHEMA, *name),
            [schema, name] => (*schema, *name),
            _ => return Err(LakeError::InvalidArgument(format!("invalid table name {qualified:?}"))),
        };
        if !is_identifier(schema) || !is_identifier(name) {
            return Err(LakeError::InvalidArgument(format!("invalid table name {qualified:?}")));
        }
        Ok(Self::new(schema.to_string(), name.to_string()))
    }

    pub fn handler(&self) -> String {
        self.name.clone()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Tables are kept in memory only when unset.
    pub warehouse: Option<PathBuf>,
    pub format: Format,
    pub compression: Option<Compression>,
    pub rows_per_part: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self { warehouse: None, format: Format::Parquet, compression: Some(Compression::Snappy), rows_per_part: 1000 }
    }
}

/// In-process table engine: a registry of clustered datasets, optionally
/// backed by a warehouse directory.
pub struct Database {
    tables: RwLock<HashMap<TableName, Arc<Dataset>>>, // Loaded tables
    options: DatabaseOptions,
}

fn poisoned<T>(_: T) -> LakeError {
    LakeError::Task("table registry lock poisoned".to_string())
}

impl Database {
    pub fn new() -> Self {
        Self { tables: RwLock::new(HashMap::new()), options: DatabaseOptions::default() }
    }

    /// Opens a session, making sure the warehouse directory is usable.
    pub fn open(options: DatabaseOptions) -> LakeResult<Self> {
        if let Some(root) = &options.warehouse {
            fs::create_dir_all(root).map_err(|e| {
                LakeError::ConnectionError(format!("warehouse {} is unavailable: {e}", root.display()))
            })?;
            // Rejects a snappy IPC combination before any table is touched.
            DatasetStorage::new(root.clone(), options.format, options.compression)?;
        }
        info!(warehouse = ?options.warehouse, format = ?options.format, rows_per_part = options.rows_per_part, "opened database");
        Ok(Self { tables: RwLock::new(HashMap::new()), options })
    }

    fn table_root(&self, name: &TableName) -> Option<PathBuf> {
        self.options.warehouse.as_ref().map(|w| w.join(&name.schema).join(&name.name))
    }

    fn storage_for(&self, name: &TableName) -> LakeResult<Option<DatasetStorage>> {
        self.table_root(name)
            .map(|root| DatasetStorage::new(root, self.options.format, self.options.compression))
            .transpose()
    }

    /// Registered table, or one loaded from the warehouse on first use.
    fn lookup(&self, name: &TableName) -> LakeResult<Option<Arc<Dataset>>> {
        if let Some(ds) = self.tables.read().map_err(poisoned)?.get(name) {
            return Ok(Some(ds.clone()));
        }
        let root = match self.table_root(name) {
            Some(root) => root,
            None => return Ok(None),
        };
        let mut tables = self.tables.write().map_err(poisoned)?;
        if let Some(ds) = tables.get(name) {
            return Ok(Some(ds.clone()));
        }
        match Dataset::from_storage(&root, self.options.rows_per_part)? {
            Some(ds) => {
                debug!(table = %name, "loaded table from warehouse");
                let ds = Arc::new(ds);
                tables.insert(name.clone(), ds.clone());
                Ok(Some(ds))
            },
            None => Ok(None),
        }
    }

    pub fn dataset(&self, table: &str) -> LakeResult<Arc<Dataset>> {
        let name = TableName::parse(table)?;
        self.lookup(&name)?.ok_or_else(|| LakeError::TableNotFound(name.to_string()))
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl TableEngine for Database {
    fn create_or_replace_table(&self, spec: &TableSpec) -> LakeResult<TableDescription> {
        let name = TableName::parse(&spec.name)?;
        match self.lookup(&name)? {
            Some(ds) => {
                ds.replace(spec)?;
                ds.describe(&name.to_string())
            },
            None => {
                let mut tables = self.tables.write().map_err(poisoned)?;
                // A concurrent creator may have won while the lock was free.
                let existing = tables.get(&name).cloned();
                if let Some(ds) = existing {
                    drop(tables);
                    ds.replace(spec)?;
                    return ds.describe(&name.to_string());
                }
                let ds = Arc::new(Dataset::create(spec, self.storage_for(&name)?, self.options.rows_per_part)?);
                tables.insert(name.clone(), ds.clone());
                ds.describe(&name.to_string())
            },
        }
    }

    fn merge(&self, request: MergeRequest) -> LakeResult<MergeMetrics> {
        let ds = self.dataset(&request.target)?;
        ds.merge(request)
    }

    fn query(&self, table: &str, filter: Option<&str>, limit: Option<usize>) -> LakeResult<DataFrame> {
        let name = TableName::parse(table)?;
        let ds = self.lookup(&name)?.ok_or_else(|| LakeError::TableNotFound(name.to_string()))?;
        ds.query(&name.handler(), filter, limit)
    }

    fn describe(&self, table: &str) -> LakeResult<TableDescription> {
        let name = TableName::parse(table)?;
        let ds = self.lookup(&name)?.ok_or_else(|| LakeError::TableNotFound(name.to_string()))?;
        ds.describe(&name.to_string())
    }

    fn history(&self, table: &str) -> LakeResult<Vec<CommitInfo>> {
        Ok(self.dataset(table)?.snapshot()?.history.clone())
    }

    fn drop_table(&self, table: &str, if_exists: bool) -> LakeResult<bool> {
        let name = TableName::parse(table)?;
        let found = self.lookup(&name)?;
        match found {
            Some(ds) => {
                self.tables.write().map_err(poisoned)?.remove(&name);
                if let Some(s) = ds.storage() {
                    fs::remove_dir_all(&s.root)?;
                }
                info!(table = %name, "dropped table");
                Ok(true)
            },
            None if if_exists => Ok(false),
            None => Err(LakeError::TableNotFound(name.to_string())),
        }
    }
}
