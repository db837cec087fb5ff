//! Lifecycle events emitted while computing a node.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishState {
    Computed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ComputeEvent {
    ComputingStarted {
        node_id: NodeId,
        node: String,
        execution_id: Uuid,
        at: DateTime<Utc>,
    },
    ComputingProgressed {
        node_id: NodeId,
        node: String,
        percent: u8,
    },
    ComputingFinished {
        node_id: NodeId,
        node: String,
        state: FinishState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        at: DateTime<Utc>,
    },
}

impl ComputeEvent {
    pub fn node(&self) -> &str {
        match self {
            ComputeEvent::ComputingStarted { node, .. }
            | ComputeEvent::ComputingProgressed { node, .. }
            | ComputeEvent::ComputingFinished { node, .. } => node,
        }
    }
}

/// Receiver of compute events. Called from worker threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ComputeEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ComputeEvent) {
        match event {
            ComputeEvent::ComputingStarted { node, execution_id, .. } => {
                info!(node = %node, execution = %execution_id, "computing started");
            }
            ComputeEvent::ComputingProgressed { node, percent, .. } => {
                info!(node = %node, percent = *percent, "computing progressed");
            }
            ComputeEvent::ComputingFinished { node, state: FinishState::Computed, .. } => {
                info!(node = %node, "computing finished");
            }
            ComputeEvent::ComputingFinished { node, error: err, .. } => {
                error!(node = %node, error = err.as_deref().unwrap_or("unknown"), "computing failed");
            }
        }
    }
}

/// Keeps every event in memory, mostly for tests and the CLI summary.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ComputeEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ComputeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Progress percentages reported for `node`, in emission order.
    pub fn progress_of(&self, node: &str) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ComputeEvent::ComputingProgressed { node: n, percent, .. } if n == node => {
                    Some(percent)
                }
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &ComputeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards events to several sinks.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &ComputeEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// `ceil(done / total * 100)`, clamped to 100.
pub fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done * 100).div_ceil(total).min(100) as u8
}
