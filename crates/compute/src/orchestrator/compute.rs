use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dataflow_storage::{ConnectionScope, DatasetKind, DatasetSpec};
use tracing::{debug, info, warn};

use super::{ComputeOutcome, Orchestrator};
use crate::computation::NodeContext;
use crate::error::ComputeError;
use crate::events::{ComputeEvent, FinishState};
use crate::executor::BatchJob;
use crate::graph::DependencyGraph;
use crate::lock::{self, LockGuard};
use crate::node::{ComputeNode, Node, NodeId};
use crate::planner::BatchPlanner;
use crate::store::NodeResolver;
use crate::validation::{evaluate_rules, FieldRule, ValidationResult};

fn has_name(node: &ComputeNode) -> bool {
    !node.name.trim().is_empty()
}

const NODE_RULES: &[FieldRule<ComputeNode>] = &[FieldRule {
    path: "name",
    message: "name is required",
    check: has_name,
}];

impl Orchestrator {
    /// Every check that must pass before a lock is taken.
    pub(super) fn validate_node(
        &self,
        resolver: &NodeResolver,
        scope: &ConnectionScope,
        node: &ComputeNode,
    ) -> Result<ValidationResult, ComputeError> {
        let mut result = ValidationResult::new();
        let computation = node.kind.computation();

        evaluate_rules(node, NODE_RULES, &mut result);
        computation.arity().check(node.dependency_ids.len(), &mut result);
        computation.validate(&mut result);

        let mut dependencies = Vec::with_capacity(node.dependency_ids.len());
        for (index, dep_id) in node.dependency_ids.iter().enumerate() {
            match resolver.get(*dep_id) {
                Ok(dep) => dependencies.push(dep),
                Err(ComputeError::NodeNotFound(_)) => result.error(
                    "dependency_ids",
                    format!("dependency {index} ({dep_id}) does not exist"),
                ),
                Err(e) => return Err(e),
            }
        }

        DependencyGraph::new(resolver, scope).ensure_no_cyclic_dependencies(node, &mut result);

        let output = match resolver.output_of(node) {
            Ok(output) => Some(output),
            Err(ComputeError::MissingOutput(_)) => {
                result.error("data_node_id", "output data node does not exist");
                None
            }
            Err(e) => return Err(e),
        };

        let mut specs = Vec::with_capacity(dependencies.len());
        for dep in &dependencies {
            match resolver.dataset_spec_of(dep) {
                Ok(spec) => specs.push(spec),
                Err(ComputeError::MissingOutput(name)) => result.error(
                    "dependency_ids",
                    format!("dependency '{name}' has no output data node"),
                ),
                Err(e) => return Err(e),
            }
        }

        if let (true, Some(output)) = (result.is_valid(), output) {
            let output = output.dataset_spec();
            let ctx = NodeContext {
                node,
                dependencies: &specs,
                output: &output,
                scope,
            };
            computation.validate_against(&ctx, &mut result)?;
        }
        Ok(result)
    }

    pub(super) fn compute_node(
        &self,
        resolver: &NodeResolver,
        scope: &ConnectionScope,
        node_id: NodeId,
        depth: usize,
        force: bool,
    ) -> Result<ComputeOutcome, ComputeError> {
        let node = match resolver.reload(node_id)? {
            Node::Data(_) => return Ok(ComputeOutcome::UpToDate),
            Node::Compute(node) => node,
        };

        let validation = self.validate_node(resolver, scope, &node)?;
        if !validation.is_valid() {
            warn!(node = %node.name, errors = %validation.summary(), "node is not valid for computation");
            return Ok(ComputeOutcome::Invalid(validation));
        }
        for warning in &validation.warnings {
            warn!(node = %node.name, path = %warning.path, suggestion = ?warning.suggestion, "{}", warning.message);
        }

        if !force && DependencyGraph::new(resolver, scope).is_updated(node.id)? {
            debug!(node = %node.name, depth, "already up to date");
            return Ok(ComputeOutcome::UpToDate);
        }

        let Some(guard) = LockGuard::try_acquire(Arc::clone(&self.store), &node)? else {
            info!(node = %node.name, "waiting for another holder to finish computing");
            lock::await_release(
                self.store.as_ref(),
                node.id,
                self.config.lock_poll_interval(),
                self.config.lock_max_wait(),
            )?;
            resolver.reload(node.id)?;
            return Ok(ComputeOutcome::ComputedElsewhere);
        };

        let start = Utc::now();
        let timer = Instant::now();
        self.sink.emit(&ComputeEvent::ComputingStarted {
            node_id: node.id,
            node: node.name.clone(),
            execution_id: guard.execution_id(),
            at: start,
        });

        // The finish event reports the release outcome too.
        let result = match self.run_locked(resolver, scope, &node, &guard, start) {
            Ok(outcome) => guard.release().map(|()| outcome),
            Err(error) => {
                if let Err(release_error) = guard.release() {
                    warn!(node = %node.name, error = %release_error, "failed to release computing lock");
                }
                Err(error)
            }
        };

        match result {
            Ok(outcome) => {
                if let (Ok(mut metrics), ComputeOutcome::Computed { records_written, .. }) =
                    (self.metrics.write(), &outcome)
                {
                    metrics.record_success(&node.name, timer.elapsed(), *records_written);
                }
                self.sink.emit(&ComputeEvent::ComputingFinished {
                    node_id: node.id,
                    node: node.name.clone(),
                    state: FinishState::Computed,
                    error: None,
                    at: Utc::now(),
                });
                resolver.reload(node.id)?;
                Ok(outcome)
            }
            Err(error) => {
                if let Ok(mut metrics) = self.metrics.write() {
                    metrics.record_failure(&node.name);
                }
                self.sink.emit(&ComputeEvent::ComputingFinished {
                    node_id: node.id,
                    node: node.name.clone(),
                    state: FinishState::Error,
                    error: Some(error.to_string()),
                    at: Utc::now(),
                });
                Err(error)
            }
        }
    }

    /// The part of a compute that runs while holding the lock.
    fn run_locked(
        &self,
        resolver: &NodeResolver,
        scope: &ConnectionScope,
        node: &ComputeNode,
        guard: &LockGuard,
        start: DateTime<Utc>,
    ) -> Result<ComputeOutcome, ComputeError> {
        let computation = node.kind.computation();
        let dependencies = node
            .dependency_ids
            .iter()
            .map(|id| resolver.dataset_spec_of(&resolver.get(*id)?))
            .collect::<Result<Vec<DatasetSpec>, ComputeError>>()?;
        let output_spec = resolver.output_of(node)?.dataset_spec();
        let double_buffered = node.clear_data_on_compute;

        let output = scope.dataset(&output_spec)?;
        if output.use_double_buffering()? != double_buffered {
            output.set_use_double_buffering(double_buffered)?;
        }
        guard.heartbeat()?;

        let ctx = NodeContext {
            node,
            dependencies: &dependencies,
            output: &output_spec,
            scope,
        };
        computation.pre_compute(&ctx)?;
        output.update_schema(&computation.required_schema(&ctx)?)?;
        if double_buffered {
            output.recreate_dataset(DatasetKind::Write)?;
            output.create_unique_indexes(DatasetKind::Write)?;
        }
        guard.heartbeat()?;

        let (records_written, batches, pushed_down) = match computation.push_down(&ctx)? {
            Some(written) => (written, 0, true),
            None => {
                let planner = BatchPlanner {
                    processors: self.config.resolved_processors(node.max_parallel_processes),
                    limit_per_process: node.limit_per_process,
                };
                let plan = planner.plan(ctx.dependency(0)?.as_ref(), &computation.source_filter())?;
                let batches = plan.queries.len();
                let written = if plan.is_empty() {
                    0
                } else {
                    let heartbeat = guard.heartbeat_handle();
                    let job = BatchJob {
                        node,
                        computation,
                        dependencies: &dependencies,
                        output: &output_spec,
                        heartbeat: &heartbeat,
                        sink: self.sink.as_ref(),
                    };
                    job.execute(&self.pool_for(node), scope, plan.queries)?
                };
                (written, batches, false)
            }
        };

        // Fan-out closed this scope's connections; reopen the output.
        let output = scope.dataset(&output_spec)?;
        if double_buffered {
            output.create_non_unique_indexes(DatasetKind::Write)?;
            output.swap_read_write_datasets()?;
        }
        self.store.set_last_compute_starting_time(node.id, start)?;

        info!(
            node = %node.name,
            records = records_written,
            batches,
            pushed_down,
            "node computed"
        );
        Ok(ComputeOutcome::Computed {
            records_written,
            batches,
            pushed_down,
        })
    }
}
