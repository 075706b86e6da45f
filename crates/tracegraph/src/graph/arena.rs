//! Append-only node arena for one traced scope.
//!
//! A [`Graph`] owns its nodes in creation order; ids are positions, so creation order is also a
//! valid execution order. Proxies hold an `Arc<Graph>` plus a node id, and every intercepted
//! operation funnels through [`Graph::record`]:
//!
//! 1. **Localize**: references to nodes of other graphs are replaced by bridge nodes
//! 2. **Evaluate**: the target runs against the proxy values of its dependencies
//! 3. **Append**: a node capturing the target, the unresolved arguments and the proxy value is added
//!
//! After the scope closes the graph is sealed. Backends then drive the execution hooks at the
//! bottom of this file, which track per-node state, consumer counts and saved values.

use std::sync::{
    atomic::{AtomicU64, Ordering as AtomicOrdering},
    Arc, Mutex, MutexGuard, OnceLock, Weak,
};

use anyhow::anyhow;

use crate::config::TraceConfig;
use crate::error::TraceError;
use crate::value::{Kwargs, TracedValue};

use super::bridge::Bridge;
use super::node::{describe_args, Arg, GraphId, Node, NodeId, NodeRef, Target};
use super::protocol::{self, Protocol};
use super::proxy::Proxy;
use super::state::{GraphInner, NodeRecord, NodeState};

static GRAPH_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct Graph<V> {
    id: GraphId,
    validate: bool,
    inner: Mutex<GraphInner<V>>,
    bridge: OnceLock<Weak<Bridge<V>>>,
}

impl<V: TracedValue> Graph<V> {
    /// Creates an empty graph. With `validate` off, proxy values are not computed.
    pub fn new(validate: bool) -> Arc<Self> {
        Arc::new(Graph {
            id: GraphId(GRAPH_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)),
            validate,
            inner: Mutex::new(GraphInner::new()),
            bridge: OnceLock::new(),
        })
    }

    pub fn with_config(config: &TraceConfig) -> Arc<Self> {
        Self::new(config.validate)
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn validates(&self) -> bool {
        self.validate
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, id: NodeId) -> Option<Node<V>> {
        self.lock().record(id).map(|record| record.node.clone())
    }

    /// Snapshot of every node in creation order.
    pub fn nodes(&self) -> Vec<Node<V>> {
        self.lock()
            .nodes
            .iter()
            .map(|record| record.node.clone())
            .collect()
    }

    pub fn proxy(self: &Arc<Self>, id: NodeId) -> Option<Proxy<V>> {
        (id.index() < self.len()).then(|| Proxy::new(Arc::clone(self), id))
    }

    /// Proxy for the traced root, once one was designated.
    pub fn module_proxy(self: &Arc<Self>) -> Option<Proxy<V>> {
        self.module_node().map(|id| Proxy::new(Arc::clone(self), id))
    }

    pub(crate) fn module_node(&self) -> Option<NodeId> {
        self.lock().module
    }

    pub(crate) fn set_module(&self, id: NodeId) {
        self.lock().module = Some(id);
    }

    /// Appends a node whose proxy value is already known.
    pub fn add(
        self: &Arc<Self>,
        value: V,
        target: Target<V>,
        args: Vec<Arg<V>>,
        kwargs: Kwargs<Arg<V>>,
    ) -> Result<Proxy<V>, TraceError> {
        let mark = self.len();
        let id = self
            .localize_all(args, kwargs)
            .and_then(|(args, kwargs)| self.append(Some(value), target, args, kwargs))
            .map_err(|err| {
                self.discard_bridge_nodes(mark);
                err
            })?;
        Ok(Proxy::new(Arc::clone(self), id))
    }

    /// Records an intercepted operation: evaluates `target` against proxy values and appends it.
    pub(crate) fn record(
        self: &Arc<Self>,
        target: Target<V>,
        args: Vec<Arg<V>>,
        kwargs: Kwargs<Arg<V>>,
    ) -> Result<Proxy<V>, TraceError> {
        if self.is_sealed() {
            return Err(TraceError::Sealed(self.id));
        }
        // A failed operation leaves the graph as it found it, bridge nodes included.
        let mark = self.len();
        let id = self
            .localize_all(args, kwargs)
            .and_then(|(args, kwargs)| {
                let value = if self.validate {
                    Some(self.evaluate(&target, &args, &kwargs)?)
                } else {
                    None
                };
                self.append(value, target, args, kwargs)
            })
            .map_err(|err| {
                self.discard_bridge_nodes(mark);
                err
            })?;
        Ok(Proxy::new(Arc::clone(self), id))
    }

    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Bridge this graph was registered with, if it is still alive.
    pub fn bridge(&self) -> Option<Arc<Bridge<V>>> {
        self.bridge.get().and_then(Weak::upgrade)
    }

    pub(crate) fn attach_bridge(&self, bridge: &Arc<Bridge<V>>) {
        let weak = self.bridge.get_or_init(|| Arc::downgrade(bridge));
        assert!(
            weak.ptr_eq(&Arc::downgrade(bridge)),
            "graph {} is already registered with another bridge",
            self.id
        );
    }

    pub fn proxy_value(&self, id: NodeId) -> Option<V> {
        self.lock()
            .record(id)
            .and_then(|record| record.node.proxy_value.clone())
    }

    /// Real value of `id` from the latest run, unless it was released.
    pub fn value(&self, id: NodeId) -> Option<V> {
        self.ready_value(id)
    }

    pub fn save(&self, id: NodeId) {
        if let Some(record) = self.lock().record_mut(id) {
            record.saved = true;
        }
    }

    pub fn is_saved(&self, id: NodeId) -> bool {
        self.lock().record(id).is_some_and(|record| record.saved)
    }

    /// Saved values of `id`, one per iteration of the latest iterating run.
    pub fn iteration_values(&self, id: NodeId) -> Vec<V> {
        self.lock()
            .iterations
            .iter()
            .filter_map(|saved| {
                saved
                    .iter()
                    .find(|(node, _)| *node == id)
                    .map(|(_, value)| value.clone())
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner<V>> {
        self.inner.lock().expect("graph state poisoned")
    }

    fn localize_all(
        self: &Arc<Self>,
        args: Vec<Arg<V>>,
        kwargs: Kwargs<Arg<V>>,
    ) -> Result<(Vec<Arg<V>>, Kwargs<Arg<V>>), TraceError> {
        let mut localize = |node: NodeRef| self.localize(node);
        let args = args
            .into_iter()
            .map(|arg| arg.try_map_nodes(&mut localize))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(key, arg)| Ok((key, arg.try_map_nodes(&mut localize)?)))
            .collect::<Result<Kwargs<_>, TraceError>>()?;
        Ok((args, kwargs))
    }

    /// Maps `node` to a reference valid inside this graph, bridging foreign nodes in.
    fn localize(self: &Arc<Self>, node: NodeRef) -> Result<NodeRef, TraceError> {
        if node.graph == self.id {
            return Ok(node);
        }
        let bridge = self.bridge().ok_or(TraceError::Unbridged {
            graph: self.id,
            node,
        })?;
        let source = bridge.get_graph(node.graph).ok_or(TraceError::Unbridged {
            graph: self.id,
            node,
        })?;
        if !bridge.precedes(node.graph, self.id) {
            return Err(TraceError::TemporalOrder {
                graph: self.id,
                node,
            });
        }
        if let Some(existing) = bridge.get_bridge_node(node, self.id) {
            return Ok(existing);
        }
        let source_node = source.node(node.node).ok_or(TraceError::UnknownNode {
            graph: node.graph,
            node: node.node,
        })?;
        protocol::add_bridge_node(self, &bridge, node, source_node.proxy_value)
    }

    /// Pops the bridge nodes appended at or after position `mark` and forgets them on the
    /// bridge.
    fn discard_bridge_nodes(&self, mark: usize) {
        let discarded = {
            let mut inner = self.lock();
            let mut discarded = Vec::new();
            while inner.nodes.len() > mark {
                let Some(record) = inner.nodes.last() else {
                    break;
                };
                let Target::Protocol(Protocol::Bridge { source }) = &record.node.target else {
                    break;
                };
                discarded.push((*source, record.node.node_ref()));
                inner.nodes.pop();
            }
            discarded
        };
        if discarded.is_empty() {
            return;
        }
        if let Some(bridge) = self.bridge() {
            for (source, bridge_node) in discarded {
                bridge.remove_bridge_node(source, bridge_node);
            }
        }
    }

    fn evaluate(
        &self,
        target: &Target<V>,
        args: &[Arg<V>],
        kwargs: &Kwargs<Arg<V>>,
    ) -> Result<V, TraceError> {
        let (values, kwvalues) = {
            let inner = self.lock();
            for arg in args.iter().chain(kwargs.values()) {
                let mut refs = smallvec::SmallVec::<[NodeRef; 4]>::new();
                arg.collect_nodes(&mut refs);
                if let Some(missing) = refs.into_iter().find(|node| {
                    inner
                        .record(node.node)
                        .map_or(true, |record| record.node.proxy_value.is_none())
                }) {
                    return Err(TraceError::MissingProxyValue { node: missing });
                }
            }
            let device = inner.inherited_device(args.iter().chain(kwargs.values()));
            let mut lookup = |node: NodeRef| {
                inner
                    .record(node.node)
                    .and_then(|record| record.node.proxy_value.clone())
                    .ok_or_else(|| anyhow!("node {node} has no proxy value"))
            };
            let resolved = args
                .iter()
                .map(|arg| arg.resolve(&mut lookup, device.as_ref()))
                .collect::<anyhow::Result<Vec<_>>>()
                .and_then(|values| {
                    let kwvalues = kwargs
                        .iter()
                        .map(|(key, arg)| Ok((key.clone(), arg.resolve(&mut lookup, device.as_ref())?)))
                        .collect::<anyhow::Result<Kwargs<_>>>()?;
                    Ok((values, kwvalues))
                });
            resolved.map_err(|source| TraceError::Unresolvable {
                target: target.name(),
                source,
            })?
        };
        target
            .invoke(&values, &kwvalues)
            .map_err(|source| TraceError::Structural {
                target: target.name(),
                args: describe_args(args, kwargs),
                source,
            })
    }

    /// Appends a node. Every local reference must point at an existing node.
    pub(crate) fn append(
        &self,
        value: Option<V>,
        target: Target<V>,
        args: Vec<Arg<V>>,
        kwargs: Kwargs<Arg<V>>,
    ) -> Result<NodeId, TraceError> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(TraceError::Sealed(self.id));
        }
        let id = inner.next_id();
        let mut refs = smallvec::SmallVec::<[NodeRef; 4]>::new();
        for arg in args.iter().chain(kwargs.values()) {
            arg.collect_nodes(&mut refs);
        }
        if let Some(bad) = refs
            .iter()
            .find(|node| node.graph != self.id || node.node >= id)
        {
            return Err(TraceError::UnknownNode {
                graph: bad.graph,
                node: bad.node,
            });
        }
        let device = inner
            .inherited_device(args.iter().chain(kwargs.values()))
            .or_else(|| value.as_ref().and_then(TracedValue::device));
        inner.nodes.push(NodeRecord::new(Node {
            id,
            graph: self.id,
            target,
            args,
            kwargs,
            proxy_value: value,
            device,
        }));
        Ok(id)
    }

    // Execution hooks used by the interpreter and the remote wire layer.

    /// Resets every node to pending and counts its consumers: in-graph dependents plus
    /// `representations(node)` bridge nodes in other graphs.
    pub(crate) fn begin_run(&self, representations: impl Fn(NodeRef) -> usize) {
        let mut inner = self.lock();
        let mut listeners = vec![0usize; inner.nodes.len()];
        for record in &inner.nodes {
            for dependency in record.node.dependencies() {
                if dependency.graph == self.id {
                    listeners[dependency.node.index()] += 1;
                }
            }
        }
        for (record, count) in inner.nodes.iter_mut().zip(listeners) {
            record.state = NodeState::Pending;
            record.listeners = count + representations(record.node.node_ref());
        }
    }

    pub(crate) fn ready_value(&self, id: NodeId) -> Option<V> {
        match self.lock().record(id).map(|record| &record.state) {
            Some(NodeState::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Stores the value of `id` and lets its dependencies go once they have no consumer left.
    pub(crate) fn complete_node(&self, id: NodeId, value: V) {
        let mut inner = self.lock();
        let dependencies = match inner.record_mut(id) {
            Some(record) => {
                record.state = NodeState::Ready(value);
                record.node.dependencies()
            }
            None => return,
        };
        for dependency in dependencies {
            if dependency.graph == self.id {
                inner.release_listener(dependency.node);
            }
        }
        if let Some(record) = inner.record_mut(id) {
            record.release_if_unused();
        }
    }

    pub(crate) fn release_listener(&self, id: NodeId) {
        self.lock().release_listener(id);
    }

    /// Writes a value produced elsewhere (a remote run) onto `id`.
    pub(crate) fn set_value(&self, id: NodeId, value: V) -> bool {
        match self.lock().record_mut(id) {
            Some(record) => {
                record.state = NodeState::Ready(value);
                true
            }
            None => false,
        }
    }

    /// Values of saved nodes that are currently materialised.
    pub(crate) fn saved_values(&self) -> Vec<(NodeId, V)> {
        self.lock()
            .nodes
            .iter()
            .filter(|record| record.saved)
            .filter_map(|record| match &record.state {
                NodeState::Ready(value) => Some((record.node.id, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clear_iterations(&self) {
        self.lock().iterations.clear();
    }

    pub(crate) fn push_iteration(&self, values: Vec<(NodeId, V)>) {
        self.lock().iterations.push(values);
    }

    pub(crate) fn iterations(&self) -> Vec<Vec<(NodeId, V)>> {
        self.lock().iterations.clone()
    }

    /// Appends a node decoded from the wire. Proxy values are not recomputed and the sealed
    /// flag is ignored; references are still checked.
    pub(crate) fn push_decoded(
        &self,
        target: Target<V>,
        args: Vec<Arg<V>>,
        kwargs: Kwargs<Arg<V>>,
        device: Option<crate::value::Device>,
        saved: bool,
    ) -> Result<NodeId, TraceError> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let mut refs = smallvec::SmallVec::<[NodeRef; 4]>::new();
        for arg in args.iter().chain(kwargs.values()) {
            arg.collect_nodes(&mut refs);
        }
        if let Some(bad) = refs
            .iter()
            .find(|node| node.graph != self.id || node.node >= id)
        {
            return Err(TraceError::UnknownNode {
                graph: bad.graph,
                node: bad.node,
            });
        }
        if matches!(target, Target::Protocol(Protocol::Root)) && inner.module.is_none() {
            inner.module = Some(id);
        }
        let mut record = NodeRecord::new(Node {
            id,
            graph: self.id,
            target,
            args,
            kwargs,
            proxy_value: None,
            device,
        });
        record.saved = saved;
        inner.nodes.push(record);
        Ok(id)
    }
}
