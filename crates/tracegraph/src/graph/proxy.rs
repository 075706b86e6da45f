//! User-facing handles that record operations instead of performing them.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::sync::Arc;

use crate::error::TraceError;
use crate::registry::FunctionRef;
use crate::value::{BinaryOp, Device, Kwargs, Method, TracedValue};

use super::node::{Arg, Node, NodeId, NodeRef, Operator, Target};
use super::Graph;

/// Handle to one node. Proxies carry no data of their own; every operation on them appends a
/// node and returns a proxy for it.
pub struct Proxy<V> {
    graph: Arc<Graph<V>>,
    node: NodeId,
}

impl<V> Clone for Proxy<V> {
    fn clone(&self) -> Self {
        Proxy {
            graph: Arc::clone(&self.graph),
            node: self.node,
        }
    }
}

impl<V: TracedValue> Proxy<V> {
    pub(crate) fn new(graph: Arc<Graph<V>>, node: NodeId) -> Self {
        Proxy { graph, node }
    }

    pub fn graph(&self) -> &Arc<Graph<V>> {
        &self.graph
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.graph.id(), self.node)
    }

    pub fn node(&self) -> Node<V> {
        self.graph
            .node(self.node)
            .expect("proxy refers to a node of its own graph")
    }

    pub fn proxy_value(&self) -> Option<V> {
        self.graph.proxy_value(self.node)
    }

    pub fn device(&self) -> Option<Device> {
        self.node().device
    }

    /// Keeps this node's real value after execution.
    pub fn save(&self) -> Self {
        self.graph.save(self.node);
        self.clone()
    }

    /// Real value from the latest execution. `None` before execution or when the value was
    /// released because the node was not saved.
    pub fn value(&self) -> Option<V> {
        self.graph.value(self.node)
    }

    /// Saved value of this node for every iteration of the latest iterating run.
    pub fn iteration_values(&self) -> Vec<V> {
        self.graph.iteration_values(self.node)
    }

    pub fn call(&self, args: Vec<Arg<V>>, kwargs: Kwargs<Arg<V>>) -> Result<Self, TraceError> {
        if let Some(method) = self.root_method() {
            if let Some(root) = self.graph.module_proxy() {
                return method(&root, args, kwargs);
            }
        }
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(Arg::from(self));
        operands.extend(args);
        self.record(Target::Op(Operator::Call), operands, kwargs)
    }

    pub fn get_item(&self, key: impl Into<Arg<V>>) -> Result<Self, TraceError> {
        self.record(
            Target::Op(Operator::GetItem),
            vec![Arg::from(self), key.into()],
            Kwargs::new(),
        )
    }

    pub fn attr(&self, name: &str) -> Result<Self, TraceError> {
        self.record(
            Target::Op(Operator::GetAttr(name.to_string())),
            vec![Arg::from(self)],
            Kwargs::new(),
        )
    }

    pub fn len(&self) -> Result<Self, TraceError> {
        self.record(Target::Op(Operator::Len), vec![Arg::from(self)], Kwargs::new())
    }

    pub fn try_add(&self, rhs: impl Into<Arg<V>>) -> Result<Self, TraceError> {
        self.binary(BinaryOp::Add, rhs.into())
    }

    pub fn try_sub(&self, rhs: impl Into<Arg<V>>) -> Result<Self, TraceError> {
        self.binary(BinaryOp::Sub, rhs.into())
    }

    pub fn try_mul(&self, rhs: impl Into<Arg<V>>) -> Result<Self, TraceError> {
        self.binary(BinaryOp::Mul, rhs.into())
    }

    pub fn try_div(&self, rhs: impl Into<Arg<V>>) -> Result<Self, TraceError> {
        self.binary(BinaryOp::Div, rhs.into())
    }

    pub fn pow(&self, exponent: impl Into<Arg<V>>) -> Result<Self, TraceError> {
        self.binary(BinaryOp::Pow, exponent.into())
    }

    /// Records a registry function call with this proxy as its first argument.
    pub fn apply(
        &self,
        function: &FunctionRef<V>,
        args: Vec<Arg<V>>,
        kwargs: Kwargs<Arg<V>>,
    ) -> Result<Self, TraceError> {
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(Arg::from(self));
        operands.extend(args);
        self.record(Target::Function(function.clone()), operands, kwargs)
    }

    /// Evaluates the current proxy value as a boolean. No node is recorded.
    pub fn to_bool(&self) -> Result<bool, TraceError> {
        let value = self.require_proxy_value()?;
        value.to_bool().map_err(|source| TraceError::Coercion {
            node: self.node_ref(),
            source,
        })
    }

    /// Evaluates the current proxy value as an index. No node is recorded.
    pub fn to_index(&self) -> Result<i64, TraceError> {
        let value = self.require_proxy_value()?;
        value.to_index().map_err(|source| TraceError::Coercion {
            node: self.node_ref(),
            source,
        })
    }

    fn require_proxy_value(&self) -> Result<V, TraceError> {
        self.proxy_value().ok_or(TraceError::MissingProxyValue {
            node: self.node_ref(),
        })
    }

    fn binary(&self, op: BinaryOp, rhs: Arg<V>) -> Result<Self, TraceError> {
        self.record(
            Target::Op(Operator::Binary(op)),
            vec![Arg::from(self), rhs],
            Kwargs::new(),
        )
    }

    /// Method to trace instead of call: set when this proxy is an attribute fetched straight off
    /// the traced root and that attribute is not a pass-through container like a submodule.
    fn root_method(&self) -> Option<Method<V>> {
        let module = self.graph.module_node()?;
        let node = self.node();
        let fetched_from_root = matches!(
            node.args().first(),
            Some(Arg::Node(first)) if *first == NodeRef::new(self.graph.id(), module)
        );
        if !fetched_from_root {
            return None;
        }
        let value = node.proxy_value()?;
        if value.is_passthrough() {
            return None;
        }
        value.unbound_method()
    }

    /// Operations land in the innermost open scope of this proxy's bridge, or in its own graph.
    fn recording_graph(&self) -> Arc<Graph<V>> {
        self.graph
            .bridge()
            .and_then(|bridge| bridge.try_peek_graph())
            .unwrap_or_else(|| Arc::clone(&self.graph))
    }

    fn record(
        &self,
        target: Target<V>,
        args: Vec<Arg<V>>,
        kwargs: Kwargs<Arg<V>>,
    ) -> Result<Self, TraceError> {
        self.recording_graph().record(target, args, kwargs)
    }
}

impl<V: TracedValue> From<&Proxy<V>> for Arg<V> {
    fn from(proxy: &Proxy<V>) -> Self {
        Arg::Node(NodeRef::new(proxy.graph.id(), proxy.node))
    }
}

impl<V: TracedValue> From<Proxy<V>> for Arg<V> {
    fn from(proxy: Proxy<V>) -> Self {
        Arg::from(&proxy)
    }
}

impl<V: TracedValue> fmt::Debug for Proxy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy({}:{})", self.graph.id(), self.node)
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<V: TracedValue, R: Into<Arg<V>>> $trait<R> for &Proxy<V> {
            type Output = Result<Proxy<V>, TraceError>;

            fn $method(self, rhs: R) -> Self::Output {
                self.binary($op, rhs.into())
            }
        }

        impl<V: TracedValue, R: Into<Arg<V>>> $trait<R> for Proxy<V> {
            type Output = Result<Proxy<V>, TraceError>;

            fn $method(self, rhs: R) -> Self::Output {
                self.binary($op, rhs.into())
            }
        }
    };
}

impl_binary_operator!(Add, add, BinaryOp::Add);
impl_binary_operator!(Sub, sub, BinaryOp::Sub);
impl_binary_operator!(Mul, mul, BinaryOp::Mul);
impl_binary_operator!(Div, div, BinaryOp::Div);
