//! Process-wide observer for graph executions.
//!
//! Install an [`ExecutionTraceSink`] to be told when each graph run starts and how it ended.
//! Runs are numbered with monotonically increasing trace ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::graph::GraphId;

static SINK: Lazy<RwLock<Option<Arc<dyn ExecutionTraceSink>>>> = Lazy::new(|| RwLock::new(None));
static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one graph run.
#[derive(Clone, Debug)]
pub struct GraphRunContext {
    pub trace_id: u64,
    pub graph: GraphId,
    pub backend: String,
    pub nodes: usize,
    /// Index of the item being processed when the graph iterates.
    pub iteration: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failure { message: String },
}

#[derive(Clone, Debug)]
pub struct GraphRunStats {
    pub duration: Duration,
    pub executed: usize,
    pub status: RunStatus,
}

pub trait ExecutionTraceSink: Send + Sync {
    fn before_graph(&self, context: &GraphRunContext);
    fn after_graph(&self, context: &GraphRunContext, stats: &GraphRunStats);
}

/// Installs `sink` and returns the previously installed one.
pub fn install_sink(sink: Arc<dyn ExecutionTraceSink>) -> Option<Arc<dyn ExecutionTraceSink>> {
    SINK.write().expect("trace sink poisoned").replace(sink)
}

pub fn clear_sink() -> Option<Arc<dyn ExecutionTraceSink>> {
    SINK.write().expect("trace sink poisoned").take()
}

pub fn current_sink() -> Option<Arc<dyn ExecutionTraceSink>> {
    SINK.read().expect("trace sink poisoned").clone()
}

pub fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}
