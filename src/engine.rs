use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::LakeResult;
use crate::schema::{TableSchema, TableSpec};

/// What a merge does with a source row that matches a target row.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedAction {
    UpdateAll,
    Ignore,
}

/// What a merge does with a source row that matches nothing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotMatchedAction {
    InsertAll,
    Ignore,
}

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

/// Shared between a caller and a transaction the caller may give up on.
///
/// Whichever of [`CommitGuard::begin_commit`] and [`CommitGuard::abandon`]
/// runs first wins. An abandoned transaction can no longer publish, and one
/// that started publishing can no longer be abandoned.
#[derive(Debug, Clone, Default)]
pub struct CommitGuard(Arc<AtomicU8>);

impl CommitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the right to publish. False once the caller has given up.
    pub fn begin_commit(&self) -> bool {
        match self.0.compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == COMMITTING,
        }
    }

    /// False when a commit is already being published.
    pub fn abandon(&self) -> bool {
        match self.0.compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == ABANDONED,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire) == ABANDONED
    }
}

pub struct MergeRequest {
    pub target: String,
    pub target_alias: String,
    pub source: DataFrame,
    pub source_alias: String,
    pub predicate: String,
    pub when_matched: MatchedAction,
    pub when_not_matched: NotMatchedAction,
    pub guard: Option<CommitGuard>,
}

impl MergeRequest {
    /// Upsert of `source` into `target` with the usual `target`/`source` aliases.
    pub fn upsert(target: &str, source: DataFrame, predicate: &str) -> Self {
        Self {
            target: target.to_string(),
            target_alias: "target".to_string(),
            source,
            source_alias: "source".to_string(),
            predicate: predicate.to_string(),
            when_matched: MatchedAction::UpdateAll,
            when_not_matched: NotMatchedAction::InsertAll,
            guard: None,
        }
    }

    pub fn with_aliases(mut self, target_alias: &str, source_alias: &str) -> Self {
        self.target_alias = target_alias.to_string();
        self.source_alias = source_alias.to_string();
        self
    }

    pub fn when_matched(mut self, action: MatchedAction) -> Self {
        self.when_matched = action;
        self
    }

    pub fn when_not_matched(mut self, action: NotMatchedAction) -> Self {
        self.when_not_matched = action;
        self
    }

    /// The merge fails with `Cancelled` instead of committing once `guard` is abandoned.
    pub fn with_guard(mut self, guard: CommitGuard) -> Self {
        self.guard = Some(guard);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeMetrics {
    pub num_source_rows: usize,
    pub num_target_rows_updated: usize,
    pub num_target_rows_inserted: usize,
    /// Target rows carried over unchanged.
    pub num_target_rows_copied: usize,
    pub num_output_rows: usize,
    pub num_target_files_added: usize,
    pub num_target_files_removed: usize,
    pub execution_time_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Operation {
    CreateOrReplace { cluster_columns: Vec<String> },
    Merge { predicate: String, metrics: MergeMetrics },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub version: u64,
    pub timestamp_ms: u64,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDescription {
    pub name: String,
    pub schema: TableSchema,
    pub cluster_columns: Vec<String>,
    pub version: u64,
    pub num_rows: usize,
    pub num_parts: usize,
    pub location: Option<String>,
}

/// Capabilities the demo pipeline needs from a table engine.
///
/// Implementations own transactions and layout; callers only see these
/// operations and [`crate::error::LakeError`].
pub trait TableEngine: Send + Sync {
    /// Creates `spec.name`, replacing any table of that name and its contents.
    fn create_or_replace_table(&self, spec: &TableSpec) -> LakeResult<TableDescription>;

    /// Applies a merge as one transaction.
    fn merge(&self, request: MergeRequest) -> LakeResult<MergeMetrics>;

    /// Reads rows matching an optional SQL filter, at most `limit` of them.
    fn query(&self, table: &str, filter: Option<&str>, limit: Option<usize>) -> LakeResult<DataFrame>;

    fn describe(&self, table: &str) -> LakeResult<TableDescription>;

    fn history(&self, table: &str) -> LakeResult<Vec<CommitInfo>>;

    /// Returns whether a table was dropped.
    fn drop_table(&self, table: &str, if_exists: bool) -> LakeResult<bool>;
}
