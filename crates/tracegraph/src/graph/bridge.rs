//! Cross-graph registry for graphs that are open at the same time.
//!
//! Registration order is temporal order: a graph may only read values from graphs that were
//! registered before it. The stack tracks which scope is innermost, and `locks` counts the
//! cross-graph ties that must be consumed before the bridge can be torn down.

use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
    Arc, Mutex, MutexGuard,
};

use anyhow::{anyhow, Result};
use tracing::{debug, trace};

use crate::error::{BackendError, TraceError};
use crate::value::TracedValue;

use super::node::{GraphId, NodeRef};
use super::Graph;

pub struct Bridge<V> {
    state: Mutex<BridgeState<V>>,
    locks: AtomicUsize,
}

struct BridgeState<V> {
    id_to_graph: Vec<Arc<Graph<V>>>,
    positions: HashMap<GraphId, usize>,
    graph_stack: Vec<GraphId>,
    bridged_nodes: HashMap<NodeRef, Vec<NodeRef>>,
    /// Outstanding (source, consuming graph) ties; each one holds a lock.
    ties: HashSet<(NodeRef, GraphId)>,
}

impl<V: TracedValue> Bridge<V> {
    pub fn new() -> Arc<Self> {
        Arc::new(Bridge {
            state: Mutex::new(BridgeState {
                id_to_graph: Vec::new(),
                positions: HashMap::new(),
                graph_stack: Vec::new(),
                bridged_nodes: HashMap::new(),
                ties: HashSet::new(),
            }),
            locks: AtomicUsize::new(0),
        })
    }

    /// Registers `graph` after every graph seen so far and makes it the innermost scope.
    ///
    /// # Panics
    ///
    /// Panics when the graph is already registered.
    pub fn add(self: &Arc<Self>, graph: &Arc<Graph<V>>) {
        graph.attach_bridge(self);
        let mut state = self.lock_state();
        assert!(
            !state.positions.contains_key(&graph.id()),
            "graph {} is already registered",
            graph.id()
        );
        let position = state.id_to_graph.len();
        state.positions.insert(graph.id(), position);
        state.id_to_graph.push(Arc::clone(graph));
        state.graph_stack.push(graph.id());
        debug!(graph = %graph.id(), position, "registered graph with bridge");
    }

    /// Like [`add`](Self::add), returning a guard that pops the scope when dropped.
    pub fn enter(self: &Arc<Self>, graph: &Arc<Graph<V>>) -> GraphScope<V> {
        self.add(graph);
        GraphScope {
            bridge: Arc::clone(self),
            graph: graph.id(),
            active: true,
        }
    }

    /// Innermost open graph.
    ///
    /// # Panics
    ///
    /// Panics when no scope is open.
    pub fn peek_graph(&self) -> Arc<Graph<V>> {
        self.try_peek_graph()
            .expect("peek_graph called with an empty graph stack")
    }

    pub fn try_peek_graph(&self) -> Option<Arc<Graph<V>>> {
        let state = self.lock_state();
        let top = state.graph_stack.last()?;
        state.graph(*top)
    }

    /// Closes the innermost scope.
    ///
    /// # Panics
    ///
    /// Panics when no scope is open.
    pub fn pop_graph(&self) -> Arc<Graph<V>> {
        let mut state = self.lock_state();
        let id = state
            .graph_stack
            .pop()
            .expect("pop_graph called with an empty graph stack");
        state
            .graph(id)
            .expect("stacked graphs stay registered until teardown")
    }

    pub fn depth(&self) -> usize {
        self.lock_state().graph_stack.len()
    }

    pub fn get_graph(&self, id: GraphId) -> Option<Arc<Graph<V>>> {
        self.lock_state().graph(id)
    }

    /// Registered graphs in registration order.
    pub fn graphs(&self) -> Vec<Arc<Graph<V>>> {
        self.lock_state().id_to_graph.clone()
    }

    /// True when both graphs are registered and `earlier` came first.
    pub fn precedes(&self, earlier: GraphId, later: GraphId) -> bool {
        let state = self.lock_state();
        match (state.positions.get(&earlier), state.positions.get(&later)) {
            (Some(earlier), Some(later)) => earlier < later,
            _ => false,
        }
    }

    /// Records `bridge_node` as the representation of `node` inside `bridge_node.graph`.
    /// A node has at most one representation per consuming graph.
    pub fn add_bridge_node(&self, node: NodeRef, bridge_node: NodeRef) -> Result<(), TraceError> {
        let mut state = self.lock_state();
        let representations = state.bridged_nodes.entry(node).or_default();
        if representations
            .iter()
            .any(|existing| existing.graph == bridge_node.graph)
        {
            return Err(TraceError::DuplicateBridgeNode {
                node,
                graph: bridge_node.graph,
            });
        }
        representations.push(bridge_node);
        trace!(%node, %bridge_node, "bridged node");
        Ok(())
    }

    /// Forgets `bridge_node` as a representation of `node`.
    pub(crate) fn remove_bridge_node(&self, node: NodeRef, bridge_node: NodeRef) {
        let mut state = self.lock_state();
        if let Some(representations) = state.bridged_nodes.get_mut(&node) {
            representations.retain(|existing| *existing != bridge_node);
            if representations.is_empty() {
                state.bridged_nodes.remove(&node);
            }
        }
        trace!(%node, %bridge_node, "dropped bridge node");
    }

    /// Representation of `node` inside graph `graph`, if one was added.
    pub fn get_bridge_node(&self, node: NodeRef, graph: GraphId) -> Option<NodeRef> {
        self.lock_state()
            .bridged_nodes
            .get(&node)?
            .iter()
            .find(|candidate| candidate.graph == graph)
            .copied()
    }

    pub fn representations(&self, node: NodeRef) -> Vec<NodeRef> {
        self.lock_state()
            .bridged_nodes
            .get(&node)
            .cloned()
            .unwrap_or_default()
    }

    pub fn locks(&self) -> usize {
        self.locks.load(AtomicOrdering::SeqCst)
    }

    pub fn lock(&self) {
        self.locks.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// # Panics
    ///
    /// Panics when called more often than [`lock`](Self::lock).
    pub fn unlock(&self) {
        let previous = self
            .locks
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |locks| {
                locks.checked_sub(1)
            });
        assert!(previous.is_ok(), "bridge unlocked more often than locked");
    }

    /// True when no cross-graph tie is outstanding.
    pub fn release(&self) -> bool {
        self.locks() == 0
    }

    /// Forgets every registration once released.
    pub fn teardown(&self) -> Result<(), BackendError> {
        if !self.release() {
            return Err(BackendError::BridgeLocked {
                locks: self.locks(),
            });
        }
        let mut state = self.lock_state();
        if !state.graph_stack.is_empty() {
            return Err(BackendError::execution(format!(
                "cannot tear down a bridge with {} open scope(s)",
                state.graph_stack.len()
            )));
        }
        debug!(graphs = state.id_to_graph.len(), "tearing down bridge");
        state.id_to_graph.clear();
        state.positions.clear();
        state.bridged_nodes.clear();
        state.ties.clear();
        Ok(())
    }

    /// Drops every representation held by `consumer` and releases its outstanding ties.
    /// Returns how many ties were released.
    pub fn abandon_consumer(&self, consumer: GraphId) -> usize {
        let released = {
            let mut state = self.lock_state();
            for representations in state.bridged_nodes.values_mut() {
                representations.retain(|rep| rep.graph != consumer);
            }
            state
                .bridged_nodes
                .retain(|_, representations| !representations.is_empty());
            let before = state.ties.len();
            state.ties.retain(|(_, graph)| *graph != consumer);
            before - state.ties.len()
        };
        for _ in 0..released {
            self.unlock();
        }
        debug!(graph = %consumer, released, "abandoned consumer graph");
        released
    }

    /// Takes one lock per representation of `node`; called when `node` materialises.
    pub(crate) fn acquire_ties(&self, node: NodeRef) {
        let mut state = self.lock_state();
        let consumers: Vec<GraphId> = match state.bridged_nodes.get(&node) {
            Some(representations) => representations.iter().map(|rep| rep.graph).collect(),
            None => return,
        };
        for consumer in consumers {
            if state.ties.insert((node, consumer)) {
                self.lock();
            }
        }
    }

    fn release_tie(&self, node: NodeRef, consumer: GraphId) -> bool {
        let released = self.lock_state().ties.remove(&(node, consumer));
        if released {
            self.unlock();
        }
        released
    }

    /// Reads the materialised value of `source` for `consumer`. With `consume`, the tie is
    /// released and the source may drop its value.
    pub(crate) fn bridged_value(&self, source: NodeRef, consumer: GraphId, consume: bool) -> Result<V> {
        let graph = self
            .get_graph(source.graph)
            .ok_or_else(|| anyhow!("graph {} is not registered with this bridge", source.graph))?;
        let value = graph
            .ready_value(source.node)
            .ok_or_else(|| anyhow!("bridged node {source} has not been materialised"))?;
        if consume && self.release_tie(source, consumer) {
            graph.release_listener(source.node);
        }
        Ok(value)
    }

    fn lock_state(&self) -> MutexGuard<'_, BridgeState<V>> {
        self.state.lock().expect("bridge state poisoned")
    }
}

impl<V> BridgeState<V> {
    fn graph(&self, id: GraphId) -> Option<Arc<Graph<V>>> {
        self.positions
            .get(&id)
            .map(|position| Arc::clone(&self.id_to_graph[*position]))
    }
}

/// Open scope on a bridge; pops the graph off the stack when dropped.
pub struct GraphScope<V: TracedValue> {
    bridge: Arc<Bridge<V>>,
    graph: GraphId,
    active: bool,
}

impl<V: TracedValue> GraphScope<V> {
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn bridge(&self) -> &Arc<Bridge<V>> {
        &self.bridge
    }

    pub fn close(mut self) {
        self.pop();
    }

    fn pop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let popped = self.bridge.pop_graph();
        if !std::thread::panicking() {
            assert_eq!(
                popped.id(),
                self.graph,
                "graph scopes must close innermost first"
            );
        }
    }
}

impl<V: TracedValue> Drop for GraphScope<V> {
    fn drop(&mut self) {
        self.pop();
    }
}
