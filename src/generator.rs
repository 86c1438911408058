use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::debug;

use crate::error::{LakeError, LakeResult};

pub const VALUE_UPPER_BOUND: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i32,
    pub category: String,
    pub value: f64,
}

/// Synthetic rows: sequential ids, uniform category labels and values in [0, 100).
#[derive(Debug, Clone)]
pub struct SyntheticGenerator {
    record_count: usize,
    category_cardinality: usize,
    seed: Option<u64>,
}

impl SyntheticGenerator {
    pub fn new(record_count: usize, category_cardinality: usize) -> Self {
        Self { record_count, category_cardinality, seed: None }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn generate(&self) -> LakeResult<Vec<Record>> {
        if self.record_count == 0 {
            return Err(LakeError::InvalidArgument("record count must be positive".to_string()));
        }
        if self.category_cardinality == 0 {
            return Err(LakeError::InvalidArgument("category cardinality must be positive".to_string()));
        }
        if self.record_count > i32::MAX as usize + 1 {
            return Err(LakeError::InvalidArgument(format!("{} records do not fit an INT id", self.record_count)));
        }

        let mut rng: Box<dyn RngCore> = match self.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(rand::thread_rng()),
        };
        let records = (0..self.record_count)
            .map(|i| Record {
                id: i as i32,
                category: format!("category_{}", rng.gen_range(1..=self.category_cardinality)),
                value: rng.gen_range(0.0..VALUE_UPPER_BOUND),
            })
            .collect::<Vec<Record>>();
        debug!(records = records.len(), seed = ?self.seed, "generated synthetic records");
        Ok(records)
    }
}

pub fn records_to_frame(records: &[Record]) -> PolarsResult<DataFrame> {
    let ids = records.iter().map(|r| r.id).collect::<Vec<i32>>();
    let categories = records.iter().map(|r| r.category.as_str()).collect::<Vec<&str>>();
    let values = records.iter().map(|r| r.value).collect::<Vec<f64>>();
    DataFrame::new(vec![
        Series::new("id", ids),
        Series::new("category", categories),
        Series::new("value", values),
    ])
}
