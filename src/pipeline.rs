use polars::prelude::DataFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::config::{DemoConfig, ReportQuery};
use crate::database::Database;
use crate::engine::{CommitGuard, MergeMetrics, MergeRequest, TableDescription, TableEngine};
use crate::error::{LakeError, LakeResult, Stage, StageError};
use crate::generator::{records_to_frame, SyntheticGenerator};
use crate::schema::TableSpec;

pub const MERGE_CONDITION: &str = "target.id = source.id";

/// Explicit handle on the engine every stage works through.
pub struct Session {
    engine: Arc<dyn TableEngine>,
}

impl Session {
    pub fn open(config: &DemoConfig) -> LakeResult<Self> {
        let db = Database::open(config.database_options())?;
        Ok(Self::with_engine(Arc::new(db)))
    }

    pub fn with_engine(engine: Arc<dyn TableEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> Arc<dyn TableEngine> {
        self.engine.clone()
    }

    pub fn close(self) {
        debug!("session closed");
    }
}

pub fn demo_table_spec(config: &DemoConfig) -> LakeResult<TableSpec> {
    TableSpec::builder(&config.table_name)
        .add_column("id", "INT")
        .add_column("category", "STRING")
        .add_column("value", "DOUBLE")
        .cluster_by(&config.cluster_columns)
        .build()
}

pub fn provision_table(engine: &dyn TableEngine, spec: &TableSpec) -> LakeResult<TableDescription> {
    let description = engine.create_or_replace_table(spec)?;
    info!(table = %description.name, version = description.version, cluster_by = ?description.cluster_columns, "table ready");
    Ok(description)
}

/// Upserts `source` by id. Only transaction conflicts are retried, and
/// nothing is committed once `guard` is abandoned.
pub fn apply_upsert(engine: &dyn TableEngine, table: &str, source: DataFrame, retries: u32, guard: &CommitGuard) -> LakeResult<MergeMetrics> {
    let mut attempt = 0;
    loop {
        if guard.is_abandoned() {
            return Err(LakeError::Cancelled);
        }
        let request = MergeRequest::upsert(table, source.clone(), MERGE_CONDITION).with_guard(guard.clone());
        match engine.merge(request) {
            Err(e) if e.is_conflict() && attempt < retries => {
                attempt += 1;
                warn!(attempt, retries, error = %e, "merge conflicted, retrying");
            },
            other => return other,
        }
    }
}

pub struct Report {
    pub title: String,
    pub frame: DataFrame,
}

impl Report {
    pub fn render(&self) -> String {
        format!("{}\n{}", self.title, self.frame)
    }
}

pub fn run_reports(engine: &dyn TableEngine, table: &str, queries: &[ReportQuery], limit: usize) -> LakeResult<Vec<Report>> {
    queries.iter()
        .map(|q| -> LakeResult<Report> {
            let frame = engine.query(table, q.filter.as_deref(), Some(limit))?;
            debug!(title = %q.title, rows = frame.height(), "query done");
            Ok(Report { title: q.title.clone(), frame })
        })
        .collect()
}

pub struct RunSummary {
    pub table: TableDescription,
    pub metrics: MergeMetrics,
    pub reports: Vec<Report>,
    pub dropped: bool,
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: no shutdown can arrive any more.
            std::future::pending::<()>().await;
        }
    }
}

fn settle<T>(stage: Stage, joined: Result<LakeResult<T>, JoinError>) -> Result<T, StageError> {
    joined
        .map_err(|e| LakeError::Task(e.to_string()))
        .and_then(|r| r)
        .map_err(|e| {
            error!(%stage, error = %e, "stage failed");
            StageError::new(stage, e)
        })
}

/// Runs `f` off the async runtime, bounded by `timeout` and the shutdown signal.
///
/// An interrupted stage abandons the guard handed to `f`, so it cannot commit
/// later. If its commit already started, the stage is awaited instead.
async fn run_stage<T, F>(stage: Stage, timeout: Duration, shutdown: &mut watch::Receiver<bool>, f: F) -> Result<T, StageError>
where
    T: Send + 'static,
    F: FnOnce(CommitGuard) -> LakeResult<T> + Send + 'static,
{
    debug!(%stage, "stage started");
    let guard = CommitGuard::new();
    let task_guard = guard.clone();
    let mut task = tokio::task::spawn_blocking(move || f(task_guard));
    let interrupted = tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => LakeError::Cancelled,
        res = tokio::time::timeout(timeout, &mut task) => match res {
            Ok(joined) => return settle(stage, joined),
            Err(_) => LakeError::Timeout(timeout),
        },
    };
    if guard.abandon() {
        return settle(stage, Ok(Err(interrupted)));
    }
    warn!(%stage, reason = %interrupted, "stage interrupted while committing, waiting for it");
    settle(stage, task.await)
}

/// Bootstrap, generate, provision, merge, query and teardown, in that order.
pub struct Pipeline {
    config: DemoConfig,
    session: Option<Session>,
    shutdown: watch::Receiver<bool>,
    print_reports: bool,
}

impl Pipeline {
    pub fn new(config: DemoConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self { config, session: None, shutdown, print_reports: true }
    }

    /// Uses an already opened session instead of bootstrapping one.
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn print_reports(mut self, print: bool) -> Self {
        self.print_reports = print;
        self
    }

    pub async fn run(mut self) -> Result<RunSummary, StageError> {
        let timeout = self.config.stage_timeout();
        let config = Arc::new(self.config.clone());
        let shutdown = &mut self.shutdown;

        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let c = config.clone();
                run_stage(Stage::Bootstrap, timeout, shutdown, move |_| Session::open(&c)).await?
            },
        };

        let c = config.clone();
        let source = run_stage(Stage::Generate, timeout, shutdown, move |_| {
            let records = SyntheticGenerator::new(c.record_count, c.category_cardinality)
                .with_seed(c.seed)
                .generate()?;
            Ok(records_to_frame(&records)?)
        }).await?;
        info!(rows = source.height(), "generated source rows");

        let spec = demo_table_spec(&config).map_err(|e| StageError::new(Stage::Provision, e))?;
        let engine = session.engine();
        let table = run_stage(Stage::Provision, timeout, shutdown, move |_| provision_table(engine.as_ref(), &spec)).await?;

        let engine = session.engine();
        let c = config.clone();
        let metrics = run_stage(Stage::Merge, timeout, shutdown, move |guard| {
            apply_upsert(engine.as_ref(), &c.table_name, source, c.merge_retries, &guard)
        }).await?;

        let engine = session.engine();
        let c = config.clone();
        let reports = run_stage(Stage::Query, timeout, shutdown, move |_| {
            run_reports(engine.as_ref(), &c.table_name, &c.reports, c.display_limit)
        }).await?;
        if self.print_reports {
            for report in reports.iter() {
                println!("{}", report.render());
            }
        }

        let mut dropped = false;
        if config.drop_table_after {
            let engine = session.engine();
            let c = config.clone();
            dropped = run_stage(Stage::Teardown, timeout, shutdown, move |_| engine.drop_table(&c.table_name, true)).await?;
        }
        session.close();

        Ok(RunSummary { table, metrics, reports, dropped })
    }
}
