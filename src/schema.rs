use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{LakeError, LakeResult};

/// Upper bound on clustering columns, same as the delta liquid clustering limit.
pub const MAX_CLUSTER_COLUMNS: usize = 4;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    BigInt,
    Float,
    Double,
    String,
    Boolean,
}

impl ColumnType {
    pub fn dtype(&self) -> DataType {
        match self {
            ColumnType::Int => DataType::Int32,
            ColumnType::BigInt => DataType::Int64,
            ColumnType::Float => DataType::Float32,
            ColumnType::Double => DataType::Float64,
            ColumnType::String => DataType::Utf8,
            ColumnType::Boolean => DataType::Boolean,
        }
    }

    pub fn is_clusterable(&self) -> bool {
        !matches!(self, ColumnType::Boolean)
    }
}

impl FromStr for ColumnType {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" => Ok(ColumnType::Int),
            "BIGINT" | "LONG" => Ok(ColumnType::BigInt),
            "FLOAT" | "REAL" => Ok(ColumnType::Float),
            "DOUBLE" => Ok(ColumnType::Double),
            "STRING" | "VARCHAR" | "TEXT" => Ok(ColumnType::String),
            "BOOLEAN" | "BOOL" => Ok(ColumnType::Boolean),
            other => Err(LakeError::SchemaError(format!("unsupported column type {other:?}"))),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int => "INT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Float => "FLOAT",
            ColumnType::Double => "DOUBLE",
            ColumnType::String => "STRING",
            ColumnType::Boolean => "BOOLEAN",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self { name: name.to_string(), column_type, nullable: true }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> LakeResult<Self> {
        if columns.is_empty() {
            return Err(LakeError::SchemaError("a table needs at least one column".to_string()));
        }
        let mut seen = HashSet::new();
        for c in columns.iter() {
            if !is_identifier(&c.name) {
                return Err(LakeError::SchemaError(format!("invalid column name {:?}", c.name)));
            }
            if !seen.insert(c.name.to_ascii_lowercase()) {
                return Err(LakeError::SchemaError(format!("duplicate column {}", c.name)));
            }
        }
        Ok(Self { columns })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn empty_frame(&self) -> PolarsResult<DataFrame> {
        let cols = self.columns.iter()
            .map(|c| Series::new_empty(&c.name, &c.column_type.dtype()))
            .collect::<Vec<Series>>();
        DataFrame::new(cols)
    }

    /// Reorders and casts `df` to this schema. Casts must be lossless.
    pub fn conform(&self, df: DataFrame) -> LakeResult<DataFrame> {
        for name in df.get_column_names() {
            if self.column(name).is_none() {
                return Err(LakeError::SchemaError(format!("source column {name} is not in the table schema")));
            }
        }

        let mut cols = Vec::with_capacity(self.columns.len());
        for c in self.columns.iter() {
            let s = df.column(&c.name)
                .map_err(|_| LakeError::SchemaError(format!("source is missing column {}", c.name)))?;
            let dtype = c.column_type.dtype();
            let s = if s.dtype() == &dtype {
                s.clone()
            } else if !is_lossless_cast(s.dtype(), &dtype) {
                return Err(LakeError::SchemaError(format!(
                    "column {} of type {} cannot be stored as {} without loss", c.name, s.dtype(), c.column_type)));
            } else {
                s.strict_cast(&dtype).map_err(|e| {
                    LakeError::SchemaError(format!("column {} cannot be read as {}: {}", c.name, c.column_type, e))
                })?
            };
            if !c.nullable && s.null_count() > 0 {
                return Err(LakeError::ConstraintViolation(format!("column {} is NOT NULL but source has {} nulls", c.name, s.null_count())));
            }
            cols.push(s);
        }
        Ok(DataFrame::new(cols)?)
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols = self.columns.iter()
            .map(|c| if c.nullable { format!("{} {}", c.name, c.column_type) } else { format!("{} {} NOT NULL", c.name, c.column_type) })
            .collect::<Vec<String>>();
        write!(f, "({})", cols.join(", "))
    }
}

fn is_integer(dtype: &DataType) -> bool {
    matches!(dtype,
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        | DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64)
}

/// Whether values of type `from` can be stored as `to` unchanged.
///
/// Integer to integer casts are range checked by the strict cast that follows.
pub fn is_lossless_cast(from: &DataType, to: &DataType) -> bool {
    if from == to || from == &DataType::Null {
        return true;
    }
    match to {
        DataType::Int32 | DataType::Int64 => is_integer(from),
        DataType::Float32 => matches!(from, DataType::Int8 | DataType::Int16 | DataType::UInt8 | DataType::UInt16),
        DataType::Float64 => matches!(from,
            DataType::Float32 | DataType::Int8 | DataType::Int16 | DataType::Int32
            | DataType::UInt8 | DataType::UInt16 | DataType::UInt32),
        _ => false,
    }
}

/// Everything needed to create a table: name, columns and clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub schema: TableSchema,
    pub cluster_columns: Vec<String>,
}

impl TableSpec {
    pub fn builder(name: &str) -> TableSpecBuilder {
        TableSpecBuilder { name: name.to_string(), columns: Vec::new(), cluster_columns: Vec::new() }
    }
}

pub fn validate_cluster_columns(schema: &TableSchema, cluster_columns: &[String]) -> LakeResult<()> {
    if cluster_columns.len() > MAX_CLUSTER_COLUMNS {
        return Err(LakeError::SchemaError(format!(
            "at most {MAX_CLUSTER_COLUMNS} clustering columns are allowed, got {}", cluster_columns.len())));
    }
    let mut seen = HashSet::new();
    for name in cluster_columns {
        let col = schema.column(name)
            .ok_or_else(|| LakeError::SchemaError(format!("clustering column {name} is not in the schema")))?;
        if !col.column_type.is_clusterable() {
            return Err(LakeError::SchemaError(format!("cannot cluster by {name} of type {}", col.column_type)));
        }
        if !seen.insert(name.as_str()) {
            return Err(LakeError::SchemaError(format!("clustering column {name} listed twice")));
        }
    }
    Ok(())
}

/// Collects columns by type name, the way a create-table DDL does.
/// Type names are only checked in `build`.
pub struct TableSpecBuilder {
    name: String,
    columns: Vec<(String, String, bool)>,
    cluster_columns: Vec<String>,
}

impl TableSpecBuilder {
    pub fn add_column(mut self, name: &str, data_type: &str) -> Self {
        self.columns.push((name.to_string(), data_type.to_string(), true));
        self
    }

    pub fn add_not_null_column(mut self, name: &str, data_type: &str) -> Self {
        self.columns.push((name.to_string(), data_type.to_string(), false));
        self
    }

    pub fn cluster_by<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.cluster_columns = columns.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    pub fn build(self) -> LakeResult<TableSpec> {
        let columns = self.columns.iter()
            .map(|(name, data_type, nullable)| {
                let column_type = data_type.parse::<ColumnType>()?;
                Ok(ColumnDef { name: name.clone(), column_type, nullable: *nullable })
            })
            .collect::<LakeResult<Vec<ColumnDef>>>()?;
        let schema = TableSchema::new(columns)?;
        validate_cluster_columns(&schema, &self.cluster_columns)?;
        Ok(TableSpec { name: self.name, schema, cluster_columns: self.cluster_columns })
    }
}
