//! Bounded worker pool and batch execution.
//!
//! The caller's connection scope is released before and after every
//! fan-out. Each worker opens its own child scope, which closes when the
//! worker's share of the items is done, so no connection is ever shared
//! between threads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use dataflow_core::Record;
use dataflow_storage::{ConnectionScope, DatasetSpec, Where};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::computation::{BatchContext, Computation};
use crate::error::ComputeError;
use crate::events::{progress_percent, ComputeEvent, EventSink};
use crate::lock::Heartbeat;
use crate::node::ComputeNode;

/// Runs jobs on at most `workers` threads, or inline when `workers` is 0.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    pub fn sequential() -> Self {
        Self { workers: 0 }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` over every item. The first failure stops further items
    /// from starting and is returned once running ones finish.
    pub fn run<T, R, F>(
        &self,
        scope: &ConnectionScope,
        items: Vec<T>,
        job: F,
    ) -> Result<Vec<R>, ComputeError>
    where
        T: Send,
        R: Send,
        F: Fn(&ConnectionScope, usize, T) -> Result<R, ComputeError> + Sync,
    {
        scope.release();
        let result = if self.workers == 0 || items.len() <= 1 {
            run_inline(scope, items, &job)
        } else {
            self.run_parallel(scope, items, &job)
        };
        scope.release();
        result
    }

    fn run_parallel<T, R, F>(
        &self,
        scope: &ConnectionScope,
        items: Vec<T>,
        job: &F,
    ) -> Result<Vec<R>, ComputeError>
    where
        T: Send,
        R: Send,
        F: Fn(&ConnectionScope, usize, T) -> Result<R, ComputeError> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("dataflow-worker-{i}"))
            .build()
            .map_err(|e| ComputeError::Pool(e.to_string()))?;

        let aborted = AtomicBool::new(false);
        let first_error: Mutex<Option<ComputeError>> = Mutex::new(None);
        let record_error = |error: ComputeError| {
            aborted.store(true, Ordering::Release);
            if let Ok(mut slot) = first_error.lock() {
                slot.get_or_insert(error);
            }
        };

        let outputs: Vec<Option<R>> = pool.install(|| {
            items
                .into_par_iter()
                .enumerate()
                .map_init(
                    || scope.child(),
                    |worker_scope, (index, item)| {
                        if aborted.load(Ordering::Acquire) {
                            return None;
                        }
                        match guarded(|| job(worker_scope, index, item)) {
                            Ok(output) => Some(output),
                            Err(error) => {
                                record_error(error);
                                None
                            }
                        }
                    },
                )
                .collect()
        });

        let first_error = first_error
            .into_inner()
            .map_err(|e| ComputeError::LockPoisoned(format!("worker error slot: {e}")))?;
        match first_error {
            Some(error) => Err(error),
            None => Ok(outputs.into_iter().flatten().collect()),
        }
    }
}

fn run_inline<T, R, F>(scope: &ConnectionScope, items: Vec<T>, job: &F) -> Result<Vec<R>, ComputeError>
where
    F: Fn(&ConnectionScope, usize, T) -> Result<R, ComputeError>,
{
    let worker_scope = scope.child();
    let mut outputs = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        outputs.push(guarded(|| job(&worker_scope, index, item))?);
    }
    Ok(outputs)
}

/// Run `f`, turning a panic into [`ComputeError::RemoteExecution`].
fn guarded<R>(f: impl FnOnce() -> Result<R, ComputeError>) -> Result<R, ComputeError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            warn!(error = %message, "worker panicked");
            Err(ComputeError::RemoteExecution(message))
        }
    }
}

/// Everything the batch workers of one compute share.
pub struct BatchJob<'a> {
    pub node: &'a ComputeNode,
    pub computation: &'a dyn Computation,
    /// Dataset of each dependency, in order. Batches range over dependency 0.
    pub dependencies: &'a [DatasetSpec],
    pub output: &'a DatasetSpec,
    pub heartbeat: &'a Heartbeat,
    pub sink: &'a dyn EventSink,
}

impl BatchJob<'_> {
    /// Compute every batch, appending each batch's records to the output as
    /// soon as it is ready. Returns the number of written records.
    pub fn execute(&self, pool: &WorkerPool, scope: &ConnectionScope, queries: Vec<Where>) -> Result<u64, ComputeError> {
        let total = queries.len();
        let finished = AtomicUsize::new(0);

        let written = pool.run(scope, queries, |worker_scope, index, query| {
            let written = self
                .execute_batch(worker_scope, &query)
                .map_err(|e| ComputeError::Batch {
                    index,
                    source: Box::new(e),
                })?;
            self.heartbeat.beat()?;

            let done = finished.fetch_add(1, Ordering::AcqRel) + 1;
            self.sink.emit(&ComputeEvent::ComputingProgressed {
                node_id: self.node.id,
                node: self.node.name.clone(),
                percent: progress_percent(done, total),
            });
            Ok(written)
        })?;

        Ok(written.into_iter().sum())
    }

    fn execute_batch(&self, scope: &ConnectionScope, query: &Where) -> Result<u64, ComputeError> {
        let ctx = BatchContext::new(scope, self.dependencies);
        if ctx.dependency(0)?.count(query)? == 0 {
            debug!(node = %self.node.name, query = %query, "skipping empty batch");
            return Ok(0);
        }
        let records: Vec<Record> = self.computation.compute_batch(&ctx, query)?;
        if records.is_empty() {
            return Ok(0);
        }
        let written = scope.dataset(self.output)?.add(records)?;
        debug!(node = %self.node.name, records = written, "batch written");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dataflow_storage::{BackendRegistry, MemoryBackend};

    use super::*;

    fn scope_over(backend: &MemoryBackend) -> ConnectionScope {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(backend.clone()));
        ConnectionScope::new(Arc::new(registry))
    }

    #[test]
    fn results_keep_item_order() {
        let backend = MemoryBackend::new("mem");
        let scope = scope_over(&backend);
        let out = WorkerPool::new(3)
            .run(&scope, (0..20).collect(), |_, index, item: i32| {
                assert_eq!(index as i32, item);
                Ok(item * 2)
            })
            .unwrap();
        assert_eq!(out, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn first_failure_propagates() {
        let backend = MemoryBackend::new("mem");
        let scope = scope_over(&backend);
        let err = WorkerPool::new(2)
            .run(&scope, (0..10).collect(), |_, _, item: i32| {
                if item == 3 {
                    Err(ComputeError::Unexpected("boom".into()))
                } else {
                    Ok(item)
                }
            })
            .unwrap_err();
        assert!(matches!(err, ComputeError::Unexpected(ref m) if m == "boom"));
    }

    #[test]
    fn panics_become_remote_execution_errors() {
        let backend = MemoryBackend::new("mem");
        let scope = scope_over(&backend);
        let err = WorkerPool::sequential()
            .run(&scope, vec![1], |_, _, _: i32| -> Result<(), ComputeError> {
                panic!("worker blew up")
            })
            .unwrap_err();
        assert!(matches!(err, ComputeError::RemoteExecution(ref m) if m == "worker blew up"));
    }

    #[test]
    fn worker_connections_are_closed_after_fan_out() {
        let backend = MemoryBackend::new("mem");
        let scope = scope_over(&backend);
        scope.connection("mem").unwrap();
        assert_eq!(backend.open_connections(), 1);

        WorkerPool::new(4)
            .run(&scope, (0..8).collect(), |worker_scope, _, _: i32| {
                worker_scope.connection("mem")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(backend.open_connections(), 0);
    }
}
