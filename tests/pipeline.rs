use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use liquid_lake::engine::{CommitGuard, CommitInfo};
use liquid_lake::generator::{records_to_frame, SyntheticGenerator};
use liquid_lake::pipeline::{apply_upsert, demo_table_spec, provision_table, run_reports};
use liquid_lake::{
    Database, DatabaseOptions, DemoConfig, LakeError, LakeResult, MergeMetrics, MergeRequest, Pipeline, Session,
    Stage, TableDescription, TableEngine, TableSpec,
};
use polars::prelude::*;
use tokio::sync::watch;

fn small_config() -> DemoConfig {
    DemoConfig {
        record_count: 500,
        seed: Some(42),
        rows_per_part: 50,
        ..Default::default()
    }
}

fn sorted_by_id(df: DataFrame) -> LakeResult<DataFrame> {
    Ok(df.sort(["id"], false, true)?)
}

fn full_table(engine: &dyn TableEngine, table: &str) -> LakeResult<DataFrame> {
    sorted_by_id(engine.query(table, None, None)?)
}

#[test]
fn merge_into_empty_table_then_replay() -> LakeResult<()> {
    let config = small_config();
    let db = Database::new();
    provision_table(&db, &demo_table_spec(&config)?)?;

    let records = SyntheticGenerator::new(config.record_count, config.category_cardinality).with_seed(config.seed).generate()?;
    let source = records_to_frame(&records)?;

    let first = apply_upsert(&db, &config.table_name, source.clone(), 0, &CommitGuard::new())?;
    assert_eq!(first.num_target_rows_inserted, 500);
    let after_first = full_table(&db, &config.table_name)?;
    assert!(after_first.frame_equal(&source));

    let second = apply_upsert(&db, &config.table_name, source.clone(), 0, &CommitGuard::new())?;
    assert_eq!((second.num_target_rows_updated, second.num_target_rows_inserted), (500, 0));
    assert!(full_table(&db, &config.table_name)?.frame_equal(&after_first));
    Ok(())
}

#[test]
fn provisioning_twice_resets_contents() -> LakeResult<()> {
    let config = small_config();
    let db = Database::new();
    let spec = demo_table_spec(&config)?;
    let first = provision_table(&db, &spec)?;

    let source = records_to_frame(&SyntheticGenerator::new(20, 3).generate()?)?;
    apply_upsert(&db, &config.table_name, source, 0, &CommitGuard::new())?;
    let second = provision_table(&db, &spec)?;

    assert_eq!(first.schema, second.schema);
    assert_eq!(first.cluster_columns, second.cluster_columns);
    assert_eq!(second.num_rows, 0);
    assert_eq!(db.query(&config.table_name, None, None)?.height(), 0);
    Ok(())
}

#[test]
fn filters_return_only_matching_rows() -> LakeResult<()> {
    let config = small_config();
    let db = Database::new();
    provision_table(&db, &demo_table_spec(&config)?)?;
    let source = records_to_frame(&SyntheticGenerator::new(2000, 10).with_seed(Some(9)).generate()?)?;
    apply_upsert(&db, &config.table_name, source.clone(), 0, &CommitGuard::new())?;

    let eq = db.query(&config.table_name, Some("category = 'category_1'"), None)?;
    assert!(eq.height() > 0);
    assert!(eq.column("category")?.utf8()?.into_no_null_iter().all(|c| c == "category_1"));
    let expected = source.clone().lazy().filter(col("category").eq(lit("category_1"))).collect()?;
    assert_eq!(eq.height(), expected.height());

    let range = db.query(&config.table_name, Some("value < 20"), None)?;
    assert!(range.column("value")?.f64()?.into_no_null_iter().all(|v| v < 20.0));
    let expected = source.lazy().filter(col("value").lt(lit(20.0))).collect()?;
    assert_eq!(range.height(), expected.height());

    let limited = db.query(&config.table_name, Some("value < 20"), Some(10))?;
    assert_eq!(limited.height(), 10);
    Ok(())
}

#[test]
fn compound_clustering_is_applied() -> LakeResult<()> {
    let config = DemoConfig { cluster_columns: vec!["category".into(), "value".into()], ..small_config() };
    let db = Database::new();
    let description = provision_table(&db, &demo_table_spec(&config)?)?;
    assert_eq!(description.cluster_columns, vec!["category", "value"]);

    let source = records_to_frame(&SyntheticGenerator::new(500, 5).with_seed(Some(3)).generate()?)?;
    apply_upsert(&db, &config.table_name, source, 0, &CommitGuard::new())?;
    let rows = db.query(&config.table_name, None, None)?;
    let categories = rows.column("category")?.utf8()?.into_no_null_iter().collect::<Vec<&str>>();
    let mut sorted = categories.clone();
    sorted.sort();
    assert_eq!(categories, sorted);
    Ok(())
}

#[tokio::test]
async fn pipeline_runs_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = DemoConfig { warehouse: Some(dir.path().to_path_buf()), ..small_config() };
    let (_tx, rx) = watch::channel(false);

    let summary = Pipeline::new(config.clone(), rx).print_reports(false).run().await?;
    assert_eq!(summary.metrics.num_target_rows_inserted, 500);
    assert_eq!(summary.reports.len(), 3);
    assert!(summary.reports.iter().all(|r| r.frame.height() <= config.display_limit));
    assert_eq!(summary.reports[0].frame.height(), 10);
    assert!(!summary.dropped);

    // The table outlives the run in the warehouse
    let db = Database::open(DatabaseOptions { warehouse: Some(dir.path().to_path_buf()), ..Default::default() })?;
    let ids = db.query(&config.table_name, None, None)?
        .column("id")?.i32()?.into_no_null_iter().collect::<HashSet<i32>>();
    assert_eq!(ids, (0..500).collect::<HashSet<i32>>());
    Ok(())
}

#[tokio::test]
async fn pipeline_can_drop_its_table() -> Result<(), Box<dyn std::error::Error>> {
    let config = DemoConfig { drop_table_after: true, ..small_config() };
    let engine = Arc::new(Database::new());
    let (_tx, rx) = watch::channel(false);

    let summary = Pipeline::new(config.clone(), rx)
        .with_session(Session::with_engine(engine.clone()))
        .print_reports(false)
        .run()
        .await?;
    assert!(summary.dropped);
    assert!(matches!(engine.describe(&config.table_name), Err(LakeError::TableNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_the_next_stage() {
    let (tx, rx) = watch::channel(false);
    tx.send(true).ok();
    let err = Pipeline::new(small_config(), rx).print_reports(false).run().await.err();
    match err {
        Some(e) => {
            assert_eq!(e.stage, Stage::Bootstrap);
            assert!(matches!(e.source, LakeError::Cancelled));
        },
        None => panic!("pipeline ignored the shutdown signal"),
    }
}

#[tokio::test]
async fn invalid_generator_input_names_the_stage() {
    let (_tx, rx) = watch::channel(false);
    let config = DemoConfig { category_cardinality: 0, ..small_config() };
    let err = Pipeline::new(config, rx).print_reports(false).run().await.err();
    assert!(matches!(err, Some(ref e) if e.stage == Stage::Generate && matches!(e.source, LakeError::InvalidArgument(_))));
}

/// Wraps a database, failing the first merges with a conflict and every
/// filtered query with a query error.
struct FlakyEngine {
    inner: Database,
    conflicts_left: AtomicU32,
}

impl TableEngine for FlakyEngine {
    fn create_or_replace_table(&self, spec: &TableSpec) -> LakeResult<TableDescription> {
        self.inner.create_or_replace_table(spec)
    }

    fn merge(&self, request: MergeRequest) -> LakeResult<MergeMetrics> {
        let left = self.conflicts_left.load(Ordering::SeqCst);
        if left > 0 {
            self.conflicts_left.store(left - 1, Ordering::SeqCst);
            return Err(LakeError::TransactionConflict { expected: 0, found: 1 });
        }
        self.inner.merge(request)
    }

    fn query(&self, table: &str, filter: Option<&str>, limit: Option<usize>) -> LakeResult<DataFrame> {
        match filter {
            Some(f) => Err(LakeError::QueryError(format!("refusing {f}"))),
            None => self.inner.query(table, None, limit),
        }
    }

    fn describe(&self, table: &str) -> LakeResult<TableDescription> {
        self.inner.describe(table)
    }

    fn history(&self, table: &str) -> LakeResult<Vec<CommitInfo>> {
        self.inner.history(table)
    }

    fn drop_table(&self, table: &str, if_exists: bool) -> LakeResult<bool> {
        self.inner.drop_table(table, if_exists)
    }
}

#[test]
fn conflicts_are_retried_within_budget() -> LakeResult<()> {
    let config = small_config();
    let engine = FlakyEngine { inner: Database::new(), conflicts_left: AtomicU32::new(2) };
    provision_table(&engine, &demo_table_spec(&config)?)?;
    let source = records_to_frame(&SyntheticGenerator::new(10, 2).generate()?)?;

    assert!(matches!(apply_upsert(&engine, &config.table_name, source.clone(), 1, &CommitGuard::new()), Err(LakeError::TransactionConflict { .. })));
    engine.conflicts_left.store(2, Ordering::SeqCst);
    let metrics = apply_upsert(&engine, &config.table_name, source, 2, &CommitGuard::new())?;
    assert_eq!(metrics.num_target_rows_inserted, 10);
    Ok(())
}

#[tokio::test]
async fn query_failure_keeps_the_merge() -> Result<(), Box<dyn std::error::Error>> {
    let config = small_config();
    let engine = Arc::new(FlakyEngine { inner: Database::new(), conflicts_left: AtomicU32::new(0) });
    let (_tx, rx) = watch::channel(false);

    let err = Pipeline::new(config.clone(), rx)
        .with_session(Session::with_engine(engine.clone()))
        .print_reports(false)
        .run()
        .await
        .err()
        .ok_or("pipeline should fail in the query stage")?;
    assert_eq!(err.stage, Stage::Query);
    assert!(matches!(err.source, LakeError::QueryError(_)));

    let history = engine.history(&config.table_name)?;
    assert_eq!(history.len(), 2);
    assert_eq!(engine.describe(&config.table_name)?.num_rows, 500);

    let rows = run_reports(engine.as_ref(), &config.table_name, &config.reports[..1], 5)?;
    assert_eq!(rows[0].frame.height(), 5);
    Ok(())
}

/// Delays every merge, as a slow or stuck engine would.
struct SlowEngine {
    inner: Database,
    delay: Duration,
}

impl TableEngine for SlowEngine {
    fn create_or_replace_table(&self, spec: &TableSpec) -> LakeResult<TableDescription> {
        self.inner.create_or_replace_table(spec)
    }

    fn merge(&self, request: MergeRequest) -> LakeResult<MergeMetrics> {
        std::thread::sleep(self.delay);
        self.inner.merge(request)
    }

    fn query(&self, table: &str, filter: Option<&str>, limit: Option<usize>) -> LakeResult<DataFrame> {
        self.inner.query(table, filter, limit)
    }

    fn describe(&self, table: &str) -> LakeResult<TableDescription> {
        self.inner.describe(table)
    }

    fn history(&self, table: &str) -> LakeResult<Vec<CommitInfo>> {
        self.inner.history(table)
    }

    fn drop_table(&self, table: &str, if_exists: bool) -> LakeResult<bool> {
        self.inner.drop_table(table, if_exists)
    }
}

#[tokio::test]
async fn timed_out_merge_never_commits() -> Result<(), Box<dyn std::error::Error>> {
    let config = DemoConfig { record_count: 100, stage_timeout_secs: 1, ..small_config() };
    let engine = Arc::new(SlowEngine { inner: Database::new(), delay: Duration::from_millis(1500) });
    let (_tx, rx) = watch::channel(false);

    let err = Pipeline::new(config.clone(), rx)
        .with_session(Session::with_engine(engine.clone()))
        .print_reports(false)
        .run()
        .await
        .err()
        .ok_or("pipeline should time out in the merge stage")?;
    assert_eq!(err.stage, Stage::Merge);
    assert!(matches!(err.source, LakeError::Timeout(_)));

    // Let the abandoned merge run to completion
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let table = engine.describe(&config.table_name)?;
    assert_eq!((table.version, table.num_rows), (0, 0));
    assert_eq!(engine.history(&config.table_name)?.len(), 1);
    Ok(())
}
