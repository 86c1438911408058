//! A small clustered lake-table engine on polars, and the liquid clustering
//! demo pipeline that drives it.

pub mod clustering;
pub mod config;
pub mod database;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod predicate;
pub mod schema;
pub mod storage;

pub use config::{CliArgs, DemoConfig, ReportQuery};
pub use database::{Database, DatabaseOptions, TableName};
pub use engine::{CommitGuard, MatchedAction, MergeMetrics, MergeRequest, NotMatchedAction, TableDescription, TableEngine};
pub use error::{LakeError, LakeResult, Stage, StageError};
pub use pipeline::{Pipeline, Session};
pub use schema::TableSpec;
