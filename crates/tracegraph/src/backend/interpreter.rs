//! In-process graph execution shared by every backend that ends up running locally.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tracing::{debug, trace};

use crate::error::{BackendError, BackendResult};
use crate::graph::{Bridge, Graph, GraphId, Node, NodeId, NodeRef, Target, ITERATION_INPUT};
use crate::trace::{self, GraphRunContext, GraphRunStats, RunStatus};
use crate::value::{Kwargs, TracedValue};

/// Everything needed to execute one graph: the graph plus the real values its `Root` and
/// `Input` nodes bind to.
pub struct GraphRun<V> {
    pub(crate) graph: Arc<Graph<V>>,
    pub(crate) root: Option<V>,
    pub(crate) inputs: Kwargs<V>,
    pub(crate) iterations: Option<Vec<V>>,
}

impl<V: Clone> Clone for GraphRun<V> {
    fn clone(&self) -> Self {
        GraphRun {
            graph: Arc::clone(&self.graph),
            root: self.root.clone(),
            inputs: self.inputs.clone(),
            iterations: self.iterations.clone(),
        }
    }
}

impl<V: TracedValue> GraphRun<V> {
    pub fn graph(&self) -> &Arc<Graph<V>> {
        &self.graph
    }

    pub fn iterates(&self) -> bool {
        self.iterations.is_some()
    }
}

/// Bindings visible to protocol nodes while a graph runs.
pub(crate) struct ExecutionEnv<'a, V> {
    pub(crate) root: Option<&'a V>,
    pub(crate) inputs: &'a Kwargs<V>,
    pub(crate) bridge: Option<&'a Arc<Bridge<V>>>,
    /// Release bridge ties as bridge nodes read them. Off for all but the last iteration.
    pub(crate) consume_bridged: bool,
}

/// Runs `run` once, or once per item when it iterates.
pub(crate) fn execute_run<V: TracedValue>(
    run: &GraphRun<V>,
    bridge: Option<&Arc<Bridge<V>>>,
    backend: &str,
) -> BackendResult<()> {
    match &run.iterations {
        Some(items) => execute_iterations(run, items, bridge, backend),
        None => {
            let env = ExecutionEnv {
                root: run.root.as_ref(),
                inputs: &run.inputs,
                bridge,
                consume_bridged: true,
            };
            run_graph(&run.graph, &env, backend, None)
        }
    }
}

pub(crate) fn execute_iterations<V: TracedValue>(
    run: &GraphRun<V>,
    items: &[V],
    bridge: Option<&Arc<Bridge<V>>>,
    backend: &str,
) -> BackendResult<()> {
    run.graph.clear_iterations();
    let mut inputs = run.inputs.clone();
    for (index, item) in items.iter().enumerate() {
        inputs.insert(ITERATION_INPUT.to_string(), item.clone());
        let env = ExecutionEnv {
            root: run.root.as_ref(),
            inputs: &inputs,
            bridge,
            consume_bridged: index + 1 == items.len(),
        };
        run_graph(&run.graph, &env, backend, Some(index))?;
        run.graph.push_iteration(run.graph.saved_values());
    }
    Ok(())
}

/// Executes queued runs in order against a shared bridge.
pub(crate) fn execute_queue<V: TracedValue>(
    runs: &[GraphRun<V>],
    bridge: &Arc<Bridge<V>>,
    backend: &str,
) -> BackendResult<()> {
    for run in runs {
        execute_run(run, Some(bridge), backend)?;
    }
    Ok(())
}

fn run_graph<V: TracedValue>(
    graph: &Arc<Graph<V>>,
    env: &ExecutionEnv<'_, V>,
    backend: &str,
    iteration: Option<usize>,
) -> BackendResult<()> {
    let sink = trace::current_sink();
    let context = GraphRunContext {
        trace_id: trace::next_trace_id(),
        graph: graph.id(),
        backend: backend.to_string(),
        nodes: graph.len(),
        iteration,
    };
    if let Some(sink) = sink.as_ref() {
        sink.before_graph(&context);
    }
    debug!(graph = %graph.id(), nodes = context.nodes, ?iteration, backend, "executing graph");

    let started = Instant::now();
    let mut executed = 0usize;
    let result = run_nodes(graph, env, &mut executed);

    if let Some(sink) = sink.as_ref() {
        let status = match &result {
            Ok(()) => RunStatus::Success,
            Err(err) => RunStatus::Failure {
                message: err.to_string(),
            },
        };
        let stats = GraphRunStats {
            duration: started.elapsed(),
            executed,
            status,
        };
        sink.after_graph(&context, &stats);
    }
    result
}

fn run_nodes<V: TracedValue>(
    graph: &Arc<Graph<V>>,
    env: &ExecutionEnv<'_, V>,
    executed: &mut usize,
) -> BackendResult<()> {
    graph.begin_run(|node| env.bridge.map_or(0, |bridge| bridge.representations(node).len()));
    for index in 0..graph.len() {
        let id = NodeId(index as u32);
        let node = graph.node(id).ok_or_else(|| {
            BackendError::execution(format!("graph {} lost node {id}", graph.id()))
        })?;
        let value = execute_node(graph, &node, env)?;
        graph.complete_node(id, value);
        if let Some(bridge) = env.bridge {
            bridge.acquire_ties(node.node_ref());
        }
        *executed += 1;
        trace!(node = %node.node_ref(), target = %node.target().name(), "materialised node");
    }
    Ok(())
}

fn execute_node<V: TracedValue>(
    graph: &Graph<V>,
    node: &Node<V>,
    env: &ExecutionEnv<'_, V>,
) -> BackendResult<V> {
    let failure = |source: anyhow::Error| BackendError::Node {
        node: node.node_ref(),
        target: node.target().name(),
        source,
    };
    let own_graph = graph.id();
    let mut lookup = |dependency: NodeRef| lookup_value(graph, own_graph, dependency);
    let device = node.device();
    let args = node
        .args()
        .iter()
        .map(|arg| arg.resolve(&mut lookup, device))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(failure)?;
    let kwargs = node
        .kwargs()
        .iter()
        .map(|(key, arg)| Ok((key.clone(), arg.resolve(&mut lookup, device)?)))
        .collect::<anyhow::Result<Kwargs<_>>>()
        .map_err(failure)?;

    let value = match node.target() {
        Target::Protocol(protocol) => protocol.execute(node, &args, env),
        target => target.invoke(&args, &kwargs),
    };
    value.map_err(failure)
}

fn lookup_value<V: TracedValue>(
    graph: &Graph<V>,
    own_graph: GraphId,
    dependency: NodeRef,
) -> anyhow::Result<V> {
    if dependency.graph != own_graph {
        return Err(anyhow!(
            "node {dependency} belongs to another graph; only bridge nodes may cross graphs"
        ));
    }
    graph
        .ready_value(dependency.node)
        .ok_or_else(|| anyhow!("node {dependency} was read after it was released or before it ran"))
}
