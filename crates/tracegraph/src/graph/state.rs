//! Internal graph bookkeeping shared by the graph and its proxies.

use crate::value::Device;

use super::node::{Arg, Node, NodeId, NodeRef};

/// Mutable graph storage protected by the mutex inside [`Graph`](super::Graph).
/// Nodes are stored in creation order; a node's id is its index.
pub(super) struct GraphInner<V> {
    pub(super) nodes: Vec<NodeRecord<V>>,
    pub(super) module: Option<NodeId>,
    pub(super) sealed: bool,
    pub(super) iterations: Vec<Vec<(NodeId, V)>>,
}

impl<V> GraphInner<V> {
    pub(super) fn new() -> Self {
        GraphInner {
            nodes: Vec::new(),
            module: None,
            sealed: false,
            iterations: Vec::new(),
        }
    }

    pub(super) fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    pub(super) fn record(&self, id: NodeId) -> Option<&NodeRecord<V>> {
        self.nodes.get(id.index())
    }

    pub(super) fn record_mut(&mut self, id: NodeId) -> Option<&mut NodeRecord<V>> {
        self.nodes.get_mut(id.index())
    }

    /// Device of the first referenced node that has one.
    pub(super) fn inherited_device<'a>(
        &self,
        args: impl IntoIterator<Item = &'a Arg<V>>,
    ) -> Option<Device>
    where
        V: 'a,
    {
        let mut refs = smallvec::SmallVec::<[NodeRef; 4]>::new();
        for arg in args {
            arg.collect_nodes(&mut refs);
        }
        refs.iter()
            .filter_map(|node| self.record(node.node))
            .find_map(|record| record.node.device.clone())
    }

    /// Decrements the pending-consumer count of `id` and drops its value once nobody needs it.
    pub(super) fn release_listener(&mut self, id: NodeId) {
        if let Some(record) = self.record_mut(id) {
            record.listeners = record.listeners.saturating_sub(1);
            record.release_if_unused();
        }
    }
}

/// Recorded node plus its execution bookkeeping.
pub(super) struct NodeRecord<V> {
    pub(super) node: Node<V>,
    pub(super) saved: bool,
    pub(super) state: NodeState<V>,
    pub(super) listeners: usize,
}

impl<V> NodeRecord<V> {
    pub(super) fn new(node: Node<V>) -> Self {
        NodeRecord {
            node,
            saved: false,
            state: NodeState::Pending,
            listeners: 0,
        }
    }

    pub(super) fn release_if_unused(&mut self) {
        if self.listeners == 0 && !self.saved && matches!(self.state, NodeState::Ready(_)) {
            self.state = NodeState::Released;
        }
    }
}

/// Materialisation state of a node within the current run.
pub(super) enum NodeState<V> {
    /// Not executed yet in this run.
    Pending,
    /// Executed; holds the real value.
    Ready(V),
    /// Executed and dropped because no consumer or save remained.
    Released,
}
