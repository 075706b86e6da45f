use std::sync::Arc;

use tracing::debug;

use crate::backend::interpreter::{self, GraphRun};
use crate::backend::wire::{self, RemoteRequest, RunPayload, RunResult};
use crate::backend::{
    Backend, IteratorBackend, IteratorMixin, LocalBackend, LocalMixin, RemoteMixin, SessionMixin,
    SessionQueue,
};
use crate::config::TraceConfig;
use crate::error::{BackendError, BackendResult, TraceError};
use crate::graph::{Bridge, Graph, GraphScope, Protocol, Proxy, Target, ITERATION_INPUT};
use crate::registry::FunctionRegistry;
use crate::value::{Kwargs, TracedValue};

/// Records one graph against a traced root.
///
/// Operations on [`Tracer::root`] and on proxies derived from it are recorded until the tracer
/// executes; execution closes the scope, seals the graph and hands the tracer to its backend.
pub struct Tracer<V: TracedValue> {
    run: GraphRun<V>,
    root: Proxy<V>,
    bridge: Option<Arc<Bridge<V>>>,
    scope: Option<GraphScope<V>>,
    backend: Option<Box<dyn Backend<Tracer<V>>>>,
}

impl<V: TracedValue> Tracer<V> {
    pub fn new(root: V, backend: impl Backend<Tracer<V>> + 'static) -> Self {
        Self::with_config(root, backend, &TraceConfig::default())
    }

    pub fn with_config(
        root: V,
        backend: impl Backend<Tracer<V>> + 'static,
        config: &TraceConfig,
    ) -> Self {
        Self::build(root, Box::new(backend), config, None)
    }

    /// Tracer registered on `bridge` as its innermost scope.
    pub(crate) fn attached(
        root: V,
        backend: Box<dyn Backend<Tracer<V>>>,
        config: &TraceConfig,
        bridge: &Arc<Bridge<V>>,
    ) -> Self {
        Self::build(root, backend, config, Some(bridge))
    }

    fn build(
        root: V,
        backend: Box<dyn Backend<Tracer<V>>>,
        config: &TraceConfig,
        bridge: Option<&Arc<Bridge<V>>>,
    ) -> Self {
        let graph = Graph::with_config(config);
        let scope = bridge.map(|bridge| bridge.enter(&graph));
        let root_id = graph
            .append(
                Some(root.structural()),
                Target::Protocol(Protocol::Root),
                Vec::new(),
                Kwargs::new(),
            )
            .expect("a fresh graph accepts its root node");
        graph.set_module(root_id);
        let root_proxy = Proxy::new(Arc::clone(&graph), root_id);
        debug!(graph = %graph.id(), backend = backend.backend_name(), "opened tracer");
        Tracer {
            run: GraphRun {
                graph,
                root: Some(root),
                inputs: Kwargs::new(),
                iterations: None,
            },
            root: root_proxy,
            bridge: bridge.cloned(),
            scope,
            backend: Some(backend),
        }
    }

    /// Proxy for the traced root.
    pub fn root(&self) -> &Proxy<V> {
        &self.root
    }

    pub fn graph(&self) -> &Arc<Graph<V>> {
        &self.run.graph
    }

    pub fn bridge(&self) -> Option<&Arc<Bridge<V>>> {
        self.bridge.as_ref()
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_ref().map(|backend| backend.backend_name())
    }

    /// Declares a named input. The proxy traces against a structural copy of `value`; the real
    /// value is bound when the graph executes.
    pub fn input(&mut self, name: &str, value: V) -> Result<Proxy<V>, TraceError> {
        let proxy = self.run.graph.add(
            value.structural(),
            Target::Protocol(Protocol::Input {
                name: name.to_string(),
            }),
            Vec::new(),
            Kwargs::new(),
        )?;
        self.run.inputs.insert(name.to_string(), value);
        Ok(proxy)
    }

    /// Embeds a constant.
    pub fn literal(&self, value: V) -> Result<Proxy<V>, TraceError> {
        self.run.graph.add(
            value,
            Target::Protocol(Protocol::Literal),
            Vec::new(),
            Kwargs::new(),
        )
    }

    /// Makes the graph iterate over `items`; the returned proxy stands for the current item.
    pub fn iteration_input(&mut self, items: Vec<V>) -> Result<Proxy<V>, TraceError> {
        let first = items.first().ok_or(TraceError::EmptyIteration)?;
        let proxy = self.run.graph.add(
            first.structural(),
            Target::Protocol(Protocol::Input {
                name: ITERATION_INPUT.to_string(),
            }),
            Vec::new(),
            Kwargs::new(),
        )?;
        self.run.iterations = Some(items);
        Ok(proxy)
    }

    pub fn set_backend(&mut self, backend: impl Backend<Tracer<V>> + 'static) {
        self.backend = Some(Box::new(backend));
    }

    /// Closes the scope and runs the backend. A failed execution leaves the graph intact, so
    /// this may be called again, possibly after [`set_backend`](Self::set_backend).
    ///
    /// # Panics
    ///
    /// Panics when a tracer opened after this one is still open on the same bridge.
    pub fn execute(&mut self) -> BackendResult<()> {
        if let Some(scope) = self.scope.take() {
            scope.close();
        }
        self.run.graph.seal();
        let backend = self
            .backend
            .take()
            .ok_or_else(|| BackendError::execution("tracer has no backend"))?;
        let result = backend.execute(self);
        self.backend = Some(backend);
        result
    }

    pub fn exit(mut self) -> BackendResult<()> {
        self.execute()
    }
}

impl<V: TracedValue> LocalMixin for Tracer<V> {
    fn local_backend_execute(&mut self) -> BackendResult<()> {
        interpreter::execute_run(&self.run, self.bridge.as_ref(), LocalBackend::NAME)
    }
}

impl<V: TracedValue> IteratorMixin for Tracer<V> {
    fn iterator_backend_execute(&mut self) -> BackendResult<()> {
        let items = self.run.iterations.as_deref().ok_or_else(|| {
            BackendError::execution("iterator backend needs an iteration input")
        })?;
        interpreter::execute_iterations(&self.run, items, self.bridge.as_ref(), IteratorBackend::NAME)
    }
}

impl<V: TracedValue> SessionMixin<V> for Tracer<V> {
    fn session_backend_handle(&mut self, queue: &SessionQueue<V>) -> BackendResult<()> {
        queue.push(self.run.clone());
        Ok(())
    }
}

impl<V: TracedValue> RemoteMixin<V> for Tracer<V> {
    fn remote_backend_request(
        &self,
        model_key: &str,
        registry: &FunctionRegistry<V>,
    ) -> BackendResult<RemoteRequest<V>> {
        let own = self.run.graph.id();
        let graph = wire::encode_graph(&self.run.graph, registry, |id| (id == own).then_some(0))?;
        Ok(RemoteRequest::new(
            model_key,
            vec![RunPayload {
                graph,
                inputs: self.run.inputs.clone(),
                iterations: self.run.iterations.clone(),
            }],
        ))
    }

    fn remote_backend_handle_result(&mut self, runs: Vec<RunResult<V>>) -> BackendResult<()> {
        let mut runs = runs.into_iter();
        match (runs.next(), runs.next()) {
            (Some(result), None) => Ok(wire::apply_run_result(&self.run.graph, result)?),
            _ => Err(BackendError::execution(
                "remote response does not hold exactly one run",
            )),
        }
    }
}
