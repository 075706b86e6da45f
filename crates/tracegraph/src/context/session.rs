use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::interpreter::{self, GraphRun};
use crate::backend::wire::{self, RemoteRequest, RunPayload, RunResult};
use crate::backend::{Backend, LocalBackend, LocalMixin, RemoteMixin, SessionBackend, SessionQueue};
use crate::config::TraceConfig;
use crate::error::{BackendError, BackendResult, TraceError};
use crate::graph::{Bridge, GraphId, Proxy};
use crate::registry::FunctionRegistry;
use crate::value::TracedValue;

use super::Tracer;

/// Groups tracers on one bridge and executes their graphs together.
///
/// Tracers opened through [`Session::trace`] defer into the session queue when they exit.
/// Queued graphs run in registration order, so a graph may read any value produced by a graph
/// opened before it. The bridge is torn down once every cross-graph tie was consumed.
pub struct Session<V: TracedValue> {
    bridge: Arc<Bridge<V>>,
    root: V,
    queue: SessionQueue<V>,
    config: TraceConfig,
    backend: Option<Box<dyn Backend<Session<V>>>>,
}

impl<V: TracedValue> Session<V> {
    pub fn new(root: V, backend: impl Backend<Session<V>> + 'static) -> Self {
        Self::with_config(root, backend, TraceConfig::default())
    }

    pub fn with_config(
        root: V,
        backend: impl Backend<Session<V>> + 'static,
        config: TraceConfig,
    ) -> Self {
        Session {
            bridge: Bridge::new(),
            root,
            queue: SessionQueue::new(),
            config,
            backend: Some(Box::new(backend)),
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge<V>> {
        &self.bridge
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Opens a tracer on the session bridge. Its graph joins the queue when it exits.
    pub fn trace(&self) -> Tracer<V> {
        Tracer::attached(
            self.root.clone(),
            Box::new(SessionBackend::new(self.queue.clone())),
            &self.config,
            &self.bridge,
        )
    }

    /// Opens a tracer whose graph runs once per item, together with the proxy for the item.
    pub fn iter(&self, items: Vec<V>) -> Result<(Tracer<V>, Proxy<V>), TraceError> {
        let mut tracer = self.trace();
        let item = tracer.iteration_input(items)?;
        Ok((tracer, item))
    }

    pub fn set_backend(&mut self, backend: impl Backend<Session<V>> + 'static) {
        self.backend = Some(Box::new(backend));
    }

    /// Runs every queued graph. The queue is kept when execution fails so it can be retried.
    ///
    /// A tracer dropped without exiting never consumes the values it bridged in, so every run
    /// fails with [`BackendError::BridgeLocked`] until
    /// [`abandon_unqueued`](Self::abandon_unqueued) gives those ties up.
    pub fn execute(&mut self) -> BackendResult<()> {
        let open = self.bridge.depth();
        if open != 0 {
            return Err(BackendError::execution(format!(
                "session executed while {open} tracer scope(s) are still open"
            )));
        }
        let backend = self
            .backend
            .take()
            .ok_or_else(|| BackendError::execution("session has no backend"))?;
        debug!(
            backend = backend.backend_name(),
            queued = self.queue.len(),
            "executing session"
        );
        let result = backend.execute(self);
        self.backend = Some(backend);
        if result.is_ok() {
            self.queue.clear();
        }
        result
    }

    /// Forgets the bridge nodes of graphs that never joined the queue and releases their ties.
    /// Returns how many ties were released.
    pub fn abandon_unqueued(&self) -> BackendResult<usize> {
        let open = self.bridge.depth();
        if open != 0 {
            return Err(BackendError::execution(format!(
                "cannot abandon ties while {open} tracer scope(s) are still open"
            )));
        }
        let queued: HashSet<GraphId> = self
            .queue
            .snapshot()
            .iter()
            .map(|run| run.graph().id())
            .collect();
        let released = self
            .bridge
            .graphs()
            .iter()
            .map(|graph| graph.id())
            .filter(|id| !queued.contains(id))
            .map(|id| self.bridge.abandon_consumer(id))
            .sum();
        Ok(released)
    }

    pub fn exit(mut self) -> BackendResult<()> {
        self.execute()
    }

    /// Queued runs in bridge registration order.
    fn ordered_runs(&self) -> Vec<GraphRun<V>> {
        let order: HashMap<GraphId, usize> = self
            .bridge
            .graphs()
            .iter()
            .enumerate()
            .map(|(position, graph)| (graph.id(), position))
            .collect();
        let mut runs = self.queue.snapshot();
        runs.sort_by_key(|run| order.get(&run.graph().id()).copied().unwrap_or(usize::MAX));
        runs
    }

    fn teardown(&self) -> BackendResult<()> {
        if !self.bridge.release() {
            warn!(
                locks = self.bridge.locks(),
                "session finished with unconsumed cross-graph ties"
            );
        }
        self.bridge.teardown()
    }
}

impl<V: TracedValue> LocalMixin for Session<V> {
    fn local_backend_execute(&mut self) -> BackendResult<()> {
        let runs = self.ordered_runs();
        interpreter::execute_queue(&runs, &self.bridge, LocalBackend::NAME)?;
        self.teardown()
    }
}

impl<V: TracedValue> RemoteMixin<V> for Session<V> {
    fn remote_backend_request(
        &self,
        model_key: &str,
        registry: &FunctionRegistry<V>,
    ) -> BackendResult<RemoteRequest<V>> {
        let runs = self.ordered_runs();
        let positions: HashMap<GraphId, u32> = runs
            .iter()
            .enumerate()
            .map(|(position, run)| (run.graph().id(), position as u32))
            .collect();
        let payloads = runs
            .iter()
            .map(|run| {
                Ok(RunPayload {
                    graph: wire::encode_graph(run.graph(), registry, |id| {
                        positions.get(&id).copied()
                    })?,
                    inputs: run.inputs.clone(),
                    iterations: run.iterations.clone(),
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(RemoteRequest::new(model_key, payloads))
    }

    fn remote_backend_handle_result(&mut self, results: Vec<RunResult<V>>) -> BackendResult<()> {
        let runs = self.ordered_runs();
        if runs.len() != results.len() {
            return Err(BackendError::execution(format!(
                "remote response holds {} run(s) for {} queued graph(s)",
                results.len(),
                runs.len()
            )));
        }
        for (run, result) in runs.iter().zip(results) {
            wire::apply_run_result(run.graph(), result)?;
        }
        self.teardown()
    }
}
