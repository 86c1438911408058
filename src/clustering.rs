use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use anyhow::anyhow;

use crate::predicate::{CompareOp, Comparison, Literal};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl StatValue {
    fn compare(&self, literal: &Literal) -> Option<Ordering> {
        match (self, literal) {
            (StatValue::Int(v), Literal::Number(n)) => (*v as f64).partial_cmp(n),
            (StatValue::Float(v), Literal::Number(n)) => v.partial_cmp(n),
            (StatValue::Str(v), Literal::Text(s)) => Some(v.as_str().cmp(s.as_str())),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub min: Option<StatValue>,
    pub max: Option<StatValue>,
    pub null_count: usize,
    /// NaN floats sit outside `[min, max]`; polars orders them above every number.
    #[serde(default)]
    pub nan_count: usize,
}

impl ColumnStats {
    /// False only when no non-null value of the part can satisfy the comparison.
    pub fn may_match(&self, op: CompareOp, literal: &Literal) -> bool {
        if self.nan_count > 0 && matches!(op, CompareOp::NotEq | CompareOp::Gt | CompareOp::GtEq) {
            return true;
        }
        let (min, max) = match (&self.min, &self.max) {
            (Some(min), Some(max)) => (min, max),
            _ => return true,
        };
        let (lo, hi) = match (min.compare(literal), max.compare(literal)) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => return true,
        };
        match op {
            CompareOp::Eq => lo != Ordering::Greater && hi != Ordering::Less,
            CompareOp::NotEq => !(lo == Ordering::Equal && hi == Ordering::Equal),
            CompareOp::Lt => lo == Ordering::Less,
            CompareOp::LtEq => lo != Ordering::Greater,
            CompareOp::Gt => hi == Ordering::Greater,
            CompareOp::GtEq => hi != Ordering::Less,
        }
    }
}

pub type PartStats = BTreeMap<String, ColumnStats>;

pub fn part_may_match(stats: &PartStats, comparisons: &[Comparison]) -> bool {
    comparisons.iter().all(|c| match stats.get(&c.column) {
        Some(s) => s.may_match(c.op, &c.literal),
        None => true,
    })
}

pub fn series_stats(arr: &Series) -> anyhow::Result<ColumnStats> {
    let null_count = arr.null_count();
    let mut nan_count = 0;
    let (min, max) = match arr.dtype() {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        | DataType::UInt8 | DataType::UInt16 | DataType::UInt32 => {
            let cast = arr.cast(&DataType::Int64)?;
            let values = cast.i64()?;
            let min = values.into_iter().flatten().min().map(StatValue::Int);
            let max = values.into_iter().flatten().max().map(StatValue::Int);
            (min, max)
        },
        DataType::Float32 | DataType::Float64 => {
            let cast = arr.cast(&DataType::Float64)?;
            let values = cast.f64()?;
            nan_count = values.into_iter().flatten().filter(|v| v.is_nan()).count();
            let finite = || values.into_iter().flatten().filter(|v| !v.is_nan());
            let min = finite().reduce(f64::min).map(StatValue::Float);
            let max = finite().reduce(f64::max).map(StatValue::Float);
            (min, max)
        },
        DataType::Utf8 => {
            let values = arr.utf8()?;
            let min = values.into_iter().flatten().min().map(|s| StatValue::Str(s.to_string()));
            let max = values.into_iter().flatten().max().map(|s| StatValue::Str(s.to_string()));
            (min, max)
        },
        _ => return Err(anyhow!("Invalid data type for clustering statistics: {}", arr.dtype())),
    };
    Ok(ColumnStats { min, max, null_count, nan_count })
}

pub fn frame_stats(df: &DataFrame, columns: &[String]) -> anyhow::Result<PartStats> {
    columns.iter()
        .map(|c| -> anyhow::Result<(String, ColumnStats)> {
            Ok((c.clone(), series_stats(df.column(c)?)?))
        })
        .collect()
}

/// Sorts `df` by the clustering columns and cuts it into parts of at most
/// `rows_per_part` rows, each with statistics for the clustering columns.
pub fn cluster_frame(df: DataFrame, cluster_columns: &[String], rows_per_part: usize) -> anyhow::Result<Vec<(DataFrame, PartStats)>> {
    if df.height() == 0 {
        return Ok(Vec::new());
    }
    let rows_per_part = rows_per_part.max(1);
    let sorted = if cluster_columns.is_empty() {
        df
    } else {
        df.sort(cluster_columns.to_vec(), vec![false; cluster_columns.len()], true)?
    };

    let height = sorted.height();
    let chunks = (0..height)
        .step_by(rows_per_part)
        .map(|offset| sorted.slice(offset as i64, rows_per_part.min(height - offset)))
        .collect::<Vec<DataFrame>>();

    chunks.into_par_iter()
        .map(|chunk| -> anyhow::Result<(DataFrame, PartStats)> {
            let stats = frame_stats(&chunk, cluster_columns)?;
            Ok((chunk, stats))
        })
        .collect()
}
