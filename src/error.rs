use std::fmt;
use std::time::Duration;

use polars::prelude::PolarsError;
use thiserror::Error;

pub type LakeResult<T> = Result<T, LakeError>;

#[derive(Debug, Error)]
pub enum LakeError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("transaction conflict: table moved from version {expected} to {found}")]
    TransactionConflict { expected: u64, found: u64 },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("query error: {0}")]
    QueryError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled by shutdown signal")]
    Cancelled,

    #[error("engine error: {0}")]
    Engine(#[from] PolarsError),

    #[error("task failed: {0}")]
    Task(String),
}

impl LakeError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LakeError::TransactionConflict { .. })
    }
}

impl From<std::io::Error> for LakeError {
    fn from(e: std::io::Error) -> Self {
        LakeError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LakeError {
    fn from(e: serde_json::Error) -> Self {
        LakeError::Storage(format!("manifest: {e}"))
    }
}

/// Pipeline step a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Bootstrap,
    Generate,
    Provision,
    Merge,
    Query,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Bootstrap => "bootstrap",
            Stage::Generate => "generate",
            Stage::Provision => "provision",
            Stage::Merge => "merge",
            Stage::Query => "query",
            Stage::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("stage failed: {stage}: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: LakeError,
}

impl StageError {
    pub fn new(stage: Stage, source: LakeError) -> Self {
        Self { stage, source }
    }
}
