use dataflow_storage::{DatasetRef, Where};
use tracing::debug;

use crate::error::ComputeError;

/// Splits a dependency's (filtered) record set into range queries over the
/// surrogate key.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    /// Processors the work is spread over. Treated as at least 1.
    pub processors: usize,
    /// Upper bound on records per batch. 0 means unbounded.
    pub limit_per_process: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub record_count: u64,
    pub batch_size: usize,
    pub queries: Vec<Where>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl BatchPlanner {
    /// `min(limit, ceil(n / processors))`, or just the quotient without a
    /// limit. Never 0 for a non-empty set.
    pub fn batch_size(&self, record_count: u64) -> usize {
        let processors = self.processors.max(1) as u64;
        let even = record_count.div_ceil(processors).max(1) as usize;
        if self.limit_per_process > 0 {
            even.min(self.limit_per_process)
        } else {
            even
        }
    }

    /// Size batches from the filtered count and let the dataset choose the
    /// range boundaries.
    pub fn plan(&self, dataset: &dyn DatasetRef, filter: &Where) -> Result<BatchPlan, ComputeError> {
        let record_count = dataset.count(filter)?;
        if record_count == 0 {
            debug!(dataset = %dataset.locator(), "nothing to partition");
            return Ok(BatchPlan::default());
        }
        let batch_size = self.batch_size(record_count);
        let queries = dataset.ordered_system_id_queries(batch_size, filter)?;
        debug!(
            dataset = %dataset.locator(),
            records = record_count,
            batch_size,
            batches = queries.len(),
            "planned batches"
        );
        Ok(BatchPlan {
            record_count,
            batch_size,
            queries,
        })
    }
}
