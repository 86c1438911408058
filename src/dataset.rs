use polars::prelude::*;
use polars_sql::SQLContext;
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::clustering::{cluster_frame, part_may_match, PartStats};
use crate::engine::{CommitGuard, CommitInfo, MatchedAction, MergeMetrics, MergeRequest, NotMatchedAction, Operation, TableDescription};
use crate::error::{LakeError, LakeResult};
use crate::predicate::{prunable_comparisons, Comparison, MergePredicate};
use crate::schema::{is_lossless_cast, validate_cluster_columns, TableSchema, TableSpec};
use crate::storage::{DatasetStorage, Manifest, PartEntry};

/// Prefix given to source columns while they are joined against the target.
const SOURCE_PREFIX: &str = "__merge_source_";

#[derive(Clone)]
pub struct DatasetPart {
    table: LazyFrame,
    rows: usize,
    stats: PartStats,
    file: Option<String>,
}

impl DatasetPart {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn stats(&self) -> &PartStats {
        &self.stats
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }
}

/// One committed version of a table. Readers hold it through an `Arc`.
#[derive(Clone)]
pub struct TableState {
    pub schema: TableSchema,
    pub cluster_columns: Vec<String>,
    pub version: u64,
    pub parts: Vec<DatasetPart>,
    pub history: Vec<CommitInfo>,
}

impl TableState {
    pub fn num_rows(&self) -> usize {
        self.parts.iter().map(|p| p.rows).sum()
    }

    /// Lazy scan over the parts whose statistics may satisfy `comparisons`.
    pub fn scan(&self, comparisons: &[Comparison]) -> LakeResult<(LazyFrame, usize)> {
        let kept = self.parts.iter()
            .filter(|p| part_may_match(&p.stats, comparisons))
            .map(|p| p.table.clone())
            .collect::<Vec<LazyFrame>>();
        let scanned = kept.len();
        if kept.is_empty() {
            return Ok((self.schema.empty_frame()?.lazy(), 0));
        }
        Ok((concat(kept, UnionArgs::default())?, scanned))
    }

    pub fn collect(&self) -> LakeResult<DataFrame> {
        let (lf, _) = self.scan(&[])?;
        Ok(lf.collect()?)
    }
}

/// A computed but not yet visible version.
pub struct PreparedCommit {
    read_version: u64,
    state: TableState,
    metrics: Option<MergeMetrics>,
    guard: Option<CommitGuard>,
}

impl PreparedCommit {
    pub fn read_version(&self) -> u64 {
        self.read_version
    }
}

pub struct Dataset {
    state: RwLock<Arc<TableState>>,
    storage: Option<DatasetStorage>, // Storage options
    rows_per_part: usize,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn layout_err(e: anyhow::Error) -> LakeError {
    LakeError::SchemaError(format!("clustered layout failed: {e}"))
}

fn key_exprs(keys: &[String], prefix: &str) -> Vec<Expr> {
    keys.iter().map(|k| col(&format!("{prefix}{k}"))).collect()
}

fn check_unique_keys(df: &DataFrame, keys: &[String]) -> LakeResult<()> {
    let distinct = df.clone().lazy()
        .select(key_exprs(keys, ""))
        .unique(None, UniqueKeepStrategy::Any)
        .collect()?
        .height();
    if distinct != df.height() {
        return Err(LakeError::ConstraintViolation(format!(
            "{} source rows share merge key ({}) with another source row",
            df.height() - distinct, keys.join(", "))));
    }
    Ok(())
}

impl Dataset {
    fn from_state(state: TableState, storage: Option<DatasetStorage>, rows_per_part: usize) -> Self {
        Self { state: RwLock::new(Arc::new(state)), storage, rows_per_part: rows_per_part.max(1) }
    }

    /// Creates an empty table at version 0, writing its manifest when stored.
    pub fn create(spec: &TableSpec, storage: Option<DatasetStorage>, rows_per_part: usize) -> LakeResult<Self> {
        validate_cluster_columns(&spec.schema, &spec.cluster_columns)?;
        if let Some(s) = &storage {
            fs::create_dir_all(&s.root)?;
        }
        let state = TableState {
            schema: spec.schema.clone(),
            cluster_columns: spec.cluster_columns.clone(),
            version: 0,
            parts: Vec::new(),
            history: vec![CommitInfo {
                version: 0,
                timestamp_ms: now_ms(),
                operation: Operation::CreateOrReplace { cluster_columns: spec.cluster_columns.clone() },
            }],
        };
        let ds = Self::from_state(state, storage, rows_per_part);
        let snapshot = ds.snapshot()?;
        ds.persist(&snapshot)?;
        info!(table = %spec.name, schema = %spec.schema, cluster_by = ?spec.cluster_columns, "created table");
        Ok(ds)
    }

    /// Loads the table described by `root/manifest.json`, if there is one.
    pub fn from_storage(root: &Path, rows_per_part: usize) -> LakeResult<Option<Self>> {
        let manifest = match DatasetStorage::read_manifest(root)? {
            Some(m) => m,
            None => return Ok(None),
        };
        let storage = DatasetStorage { root: root.to_path_buf(), ..manifest.storage.clone() };
        let parts = manifest.parts.iter()
            .map(|entry| -> LakeResult<DatasetPart> {
                Ok(DatasetPart {
                    table: storage.scan_part(&entry.file)?,
                    rows: entry.rows,
                    stats: entry.stats.clone(),
                    file: Some(entry.file.clone()),
                })
            })
            .collect::<LakeResult<Vec<DatasetPart>>>()?;
        debug!(root = %root.display(), version = manifest.version, parts = parts.len(), "loaded table manifest");
        let state = TableState {
            schema: manifest.schema,
            cluster_columns: manifest.cluster_columns,
            version: manifest.version,
            parts,
            history: manifest.history,
        };
        Ok(Some(Self::from_state(state, Some(storage), rows_per_part)))
    }

    pub fn storage(&self) -> Option<&DatasetStorage> {
        self.storage.as_ref()
    }

    pub fn snapshot(&self) -> LakeResult<Arc<TableState>> {
        self.state.read()
            .map(|s| s.clone())
            .map_err(|_| LakeError::Task("table state lock poisoned".to_string()))
    }

    /// Clusters `df` and turns it into parts, writing files when stored.
    fn layout(&self, df: DataFrame, cluster_columns: &[String], version: u64) -> LakeResult<Vec<DatasetPart>> {
        let chunks = cluster_frame(df, cluster_columns, self.rows_per_part).map_err(layout_err)?;
        let commit_id = rand::random::<u32>();
        chunks.into_par_iter()
            .enumerate()
            .map(|(i, (mut df, stats))| -> LakeResult<DatasetPart> {
                let file = match &self.storage {
                    Some(s) => {
                        let file = s.part_file_name(version, commit_id, i);
                        s.write_part(&file, &mut df)?;
                        Some(file)
                    },
                    None => None,
                };
                Ok(DatasetPart { rows: df.height(), table: df.lazy(), stats, file })
            })
            .collect()
    }

    fn persist(&self, state: &TableState) -> LakeResult<()> {
        if let Some(s) = &self.storage {
            let manifest = Manifest {
                schema: state.schema.clone(),
                cluster_columns: state.cluster_columns.clone(),
                version: state.version,
                storage: s.clone(),
                parts: state.parts.iter()
                    .map(|p| PartEntry { file: p.file.clone().unwrap_or_default(), rows: p.rows, stats: p.stats.clone() })
                    .collect(),
                history: state.history.clone(),
            };
            s.write_manifest(&manifest)?;
            // The new version is durable from here on; leftovers only cost disk space.
            match s.remove_unreferenced(&manifest) {
                Ok(removed) => debug!(version = state.version, removed, "wrote manifest"),
                Err(e) => warn!(version = state.version, error = %e, "wrote manifest, stale part files remain"),
            }
        }
        Ok(())
    }

    /// Makes `prepared` the current version unless another commit got there first.
    pub fn commit(&self, prepared: PreparedCommit) -> LakeResult<u64> {
        let mut lock = self.state.write()
            .map_err(|_| LakeError::Task("table state lock poisoned".to_string()))?;
        if lock.version != prepared.read_version {
            return Err(LakeError::TransactionConflict { expected: prepared.read_version, found: lock.version });
        }
        if let Some(guard) = &prepared.guard {
            if !guard.begin_commit() {
                return Err(LakeError::Cancelled);
            }
        }
        self.persist(&prepared.state)?;
        let version = prepared.state.version;
        *lock = Arc::new(prepared.state);
        Ok(version)
    }

    pub fn prepare_replace(&self, spec: &TableSpec) -> LakeResult<PreparedCommit> {
        validate_cluster_columns(&spec.schema, &spec.cluster_columns)?;
        let snapshot = self.snapshot()?;
        let version = snapshot.version + 1;
        let mut history = snapshot.history.clone();
        history.push(CommitInfo {
            version,
            timestamp_ms: now_ms(),
            operation: Operation::CreateOrReplace { cluster_columns: spec.cluster_columns.clone() },
        });
        let state = TableState {
            schema: spec.schema.clone(),
            cluster_columns: spec.cluster_columns.clone(),
            version,
            parts: Vec::new(),
            history,
        };
        Ok(PreparedCommit { read_version: snapshot.version, state, metrics: None, guard: None })
    }

    pub fn replace(&self, spec: &TableSpec) -> LakeResult<u64> {
        let version = self.commit(self.prepare_replace(spec)?)?;
        info!(table = %spec.name, version, schema = %spec.schema, cluster_by = ?spec.cluster_columns, "replaced table");
        Ok(version)
    }

    /// Computes the merged version against the current snapshot without publishing it.
    pub fn prepare_merge(&self, request: MergeRequest) -> LakeResult<PreparedCommit> {
        let start = Instant::now();
        let snapshot = self.snapshot()?;
        let schema = &snapshot.schema;
        let guard = request.guard.clone();

        let plan = MergePredicate::parse(&request.predicate, &request.target_alias, &request.source_alias)?;
        for (t, s) in plan.target_keys.iter().zip(plan.source_keys.iter()) {
            let tc = schema.column(t).ok_or_else(|| LakeError::SchemaError(format!("merge key {t} is not a table column")))?;
            let sc = schema.column(s).ok_or_else(|| LakeError::SchemaError(format!("merge key {s} is not a table column")))?;
            let given = request.source.column(s)
                .map_err(|_| LakeError::SchemaError(format!("merge key {s} is not a source column")))?
                .dtype();
            if tc.column_type != sc.column_type || !is_lossless_cast(given, &tc.column_type.dtype()) {
                return Err(LakeError::SchemaError(format!(
                    "merge keys {t} ({}) and {s} ({given}) have different types", tc.column_type)));
            }
        }

        let source = schema.conform(request.source)?;
        check_unique_keys(&source, &plan.source_keys)?;
        let target = snapshot.collect()?;

        let target_on = key_exprs(&plan.target_keys, "");
        let source_on = key_exprs(&plan.source_keys, "");
        let prefixed_on = key_exprs(&plan.source_keys, SOURCE_PREFIX);
        let prefixed = source.clone().lazy().select(
            schema.columns.iter()
                .map(|c| col(&c.name).alias(&format!("{SOURCE_PREFIX}{}", c.name)))
                .collect::<Vec<Expr>>(),
        );

        // Target rows no source row matches
        let untouched = target.clone().lazy()
            .join(prefixed.clone(), &target_on, &prefixed_on, JoinArgs::new(JoinType::Anti))
            .collect()?;

        let matched = match request.when_matched {
            MatchedAction::UpdateAll => {
                // Join keys are equal on both sides, so a source key column can be read from its target key.
                let updates = schema.columns.iter()
                    .map(|c| match plan.source_keys.iter().position(|k| k == &c.name) {
                        Some(i) => col(&plan.target_keys[i]).alias(&c.name),
                        None => col(&format!("{SOURCE_PREFIX}{}", c.name)).alias(&c.name),
                    })
                    .collect::<Vec<Expr>>();
                target.clone().lazy()
                    .join(prefixed.clone(), &target_on, &prefixed_on, JoinArgs::new(JoinType::Inner))
                    .select(updates)
                    .collect()?
            },
            MatchedAction::Ignore => target.clone().lazy()
                .join(prefixed.clone(), &target_on, &prefixed_on, JoinArgs::new(JoinType::Semi))
                .collect()?,
        };

        let inserted = match request.when_not_matched {
            NotMatchedAction::InsertAll => source.clone().lazy()
                .join(target.clone().lazy(), &source_on, &target_on, JoinArgs::new(JoinType::Anti))
                .collect()?,
            NotMatchedAction::Ignore => schema.empty_frame()?,
        };

        let mut metrics = MergeMetrics {
            num_source_rows: source.height(),
            num_target_rows_copied: untouched.height(),
            num_target_rows_inserted: inserted.height(),
            num_target_files_removed: snapshot.parts.len(),
            ..Default::default()
        };
        match request.when_matched {
            MatchedAction::UpdateAll => metrics.num_target_rows_updated = matched.height(),
            MatchedAction::Ignore => metrics.num_target_rows_copied += matched.height(),
        }

        let merged = concat([untouched.lazy(), matched.lazy(), inserted.lazy()], UnionArgs::default())?.collect()?;
        metrics.num_output_rows = merged.height();

        if guard.as_ref().map(|g| g.is_abandoned()).unwrap_or(false) {
            return Err(LakeError::Cancelled);
        }
        let version = snapshot.version + 1;
        let parts = self.layout(merged, &snapshot.cluster_columns, version)?;
        metrics.num_target_files_added = parts.len();
        metrics.execution_time_ms = start.elapsed().as_millis() as u64;

        let mut history = snapshot.history.clone();
        history.push(CommitInfo {
            version,
            timestamp_ms: now_ms(),
            operation: Operation::Merge { predicate: request.predicate.clone(), metrics: metrics.clone() },
        });
        let state = TableState {
            schema: snapshot.schema.clone(),
            cluster_columns: snapshot.cluster_columns.clone(),
            version,
            parts,
            history,
        };
        Ok(PreparedCommit { read_version: snapshot.version, state, metrics: Some(metrics), guard })
    }

    pub fn merge(&self, request: MergeRequest) -> LakeResult<MergeMetrics> {
        let prepared = self.prepare_merge(request)?;
        let metrics = prepared.metrics.clone().unwrap_or_default();
        let version = self.commit(prepared)?;
        info!(
            version,
            source = metrics.num_source_rows,
            updated = metrics.num_target_rows_updated,
            inserted = metrics.num_target_rows_inserted,
            copied = metrics.num_target_rows_copied,
            parts = metrics.num_target_files_added,
            "merge committed"
        );
        Ok(metrics)
    }

    /// Runs `filter` as SQL over the snapshot, skipping parts by statistics first.
    pub fn query(&self, handle: &str, filter: Option<&str>, limit: Option<usize>) -> LakeResult<DataFrame> {
        let snapshot = self.snapshot()?;
        let comparisons = filter.map(prunable_comparisons).unwrap_or_default();
        let (lf, scanned) = snapshot.scan(&comparisons)?;
        debug!(table = handle, scanned, total = snapshot.parts.len(), filter = ?filter, "data skipping");

        let mut ctx = SQLContext::new();
        ctx.register(handle, lf);
        let sql = match filter {
            Some(f) => format!("SELECT * FROM \"{handle}\" WHERE {f}"),
            None => format!("SELECT * FROM \"{handle}\""),
        };
        let lf = ctx.execute(&sql).map_err(|e| LakeError::QueryError(format!("{sql}: {e}")))?;
        let lf = match limit {
            Some(n) => {
                let n = IdxSize::try_from(n).map_err(|_| LakeError::QueryError(format!("limit {n} is too large")))?;
                lf.limit(n)
            },
            None => lf,
        };
        lf.collect().map_err(|e| LakeError::QueryError(format!("{sql}: {e}")))
    }

    pub fn describe(&self, name: &str) -> LakeResult<TableDescription> {
        let snapshot = self.snapshot()?;
        Ok(TableDescription {
            name: name.to_string(),
            schema: snapshot.schema.clone(),
            cluster_columns: snapshot.cluster_columns.clone(),
            version: snapshot.version,
            num_rows: snapshot.num_rows(),
            num_parts: snapshot.parts.len(),
            location: self.storage.as_ref().map(|s| s.root.display().to_string()),
        })
    }
}
