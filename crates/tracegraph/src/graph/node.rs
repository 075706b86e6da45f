//! Node records and the argument/target vocabulary they are built from.

use std::fmt;

use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::registry::FunctionRef;
use crate::value::{BinaryOp, Device, Kwargs, TracedValue};

use super::protocol::Protocol;

/// Process-unique graph identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub u64);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Graph-scoped sequential node identifier. Doubles as the node's position in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Fully qualified node reference: which graph, which node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub graph: GraphId,
    pub node: NodeId,
}

impl NodeRef {
    pub fn new(graph: GraphId, node: NodeId) -> Self {
        NodeRef { graph, node }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.graph, self.node)
    }
}

/// Symbolic operations a proxy records.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Call,
    GetItem,
    GetAttr(String),
    Len,
    Binary(BinaryOp),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Call => "__call__",
            Operator::GetItem => "__getitem__",
            Operator::GetAttr(_) => "fetch_attr",
            Operator::Len => "len",
            Operator::Binary(op) => op.name(),
        }
    }

    pub(crate) fn apply<V: TracedValue>(&self, args: &[V], kwargs: &Kwargs<V>) -> Result<V> {
        match self {
            Operator::Call => {
                let (callee, rest) = args
                    .split_first()
                    .ok_or_else(|| anyhow!("`__call__` needs a callee"))?;
                callee.call(rest, kwargs)
            }
            Operator::GetItem => {
                let operands = self.operands(args, 2)?;
                operands[0].get_item(&operands[1])
            }
            Operator::GetAttr(name) => self.operands(args, 1)?[0].get_attr(name),
            Operator::Len => self.operands(args, 1)?[0].length(),
            Operator::Binary(op) => {
                let operands = self.operands(args, 2)?;
                operands[0].binary(*op, &operands[1])
            }
        }
    }

    fn operands<'a, V>(&self, args: &'a [V], expected: usize) -> Result<&'a [V]> {
        ensure!(
            args.len() == expected,
            "`{}` expects {} argument(s), got {}",
            self.name(),
            expected,
            args.len()
        );
        Ok(args)
    }
}

/// What a node does when it materialises.
#[derive(Clone, Debug, PartialEq)]
pub enum Target<V> {
    Op(Operator),
    Function(FunctionRef<V>),
    Protocol(Protocol),
}

impl<V> Target<V> {
    pub fn name(&self) -> String {
        match self {
            Target::Op(op) => op.name().to_string(),
            Target::Function(function) => function.name().to_string(),
            Target::Protocol(protocol) => protocol.name().to_string(),
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Target::Protocol(_))
    }
}

impl<V: TracedValue> Target<V> {
    /// Invokes an operator or function target. Protocol targets only run inside a backend.
    pub(crate) fn invoke(&self, args: &[V], kwargs: &Kwargs<V>) -> Result<V> {
        match self {
            Target::Op(op) => op.apply(args, kwargs),
            Target::Function(function) => function.invoke(args, kwargs),
            Target::Protocol(protocol) => Err(anyhow!(
                "protocol `{}` cannot be invoked directly",
                protocol.name()
            )),
        }
    }
}

/// Unresolved argument as stored on a node.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg<V> {
    Node(NodeRef),
    Value(V),
    List(Vec<Arg<V>>),
    Dict(Kwargs<Arg<V>>),
    Slice {
        start: Option<Box<Arg<V>>>,
        stop: Option<Box<Arg<V>>>,
        step: Option<Box<Arg<V>>>,
    },
}

impl<V> Arg<V> {
    pub fn value(value: V) -> Self {
        Arg::Value(value)
    }

    pub fn slice(start: Option<Arg<V>>, stop: Option<Arg<V>>, step: Option<Arg<V>>) -> Self {
        Arg::Slice {
            start: start.map(Box::new),
            stop: stop.map(Box::new),
            step: step.map(Box::new),
        }
    }

    /// Appends every node this argument references, depth first.
    pub fn collect_nodes(&self, out: &mut SmallVec<[NodeRef; 4]>) {
        match self {
            Arg::Node(node) => out.push(*node),
            Arg::Value(_) => {}
            Arg::List(items) => items.iter().for_each(|item| item.collect_nodes(out)),
            Arg::Dict(entries) => entries.values().for_each(|item| item.collect_nodes(out)),
            Arg::Slice { start, stop, step } => {
                for bound in [start, stop, step].into_iter().flatten() {
                    bound.collect_nodes(out);
                }
            }
        }
    }

    /// Rewrites every node reference with `f`, keeping the argument's shape.
    pub(crate) fn try_map_nodes<E, F>(self, f: &mut F) -> Result<Arg<V>, E>
    where
        F: FnMut(NodeRef) -> Result<NodeRef, E>,
    {
        Ok(match self {
            Arg::Node(node) => Arg::Node(f(node)?),
            Arg::Value(value) => Arg::Value(value),
            Arg::List(items) => Arg::List(
                items
                    .into_iter()
                    .map(|item| item.try_map_nodes(f))
                    .collect::<Result<_, E>>()?,
            ),
            Arg::Dict(entries) => Arg::Dict(
                entries
                    .into_iter()
                    .map(|(key, item)| Ok((key, item.try_map_nodes(f)?)))
                    .collect::<Result<_, E>>()?,
            ),
            Arg::Slice { start, stop, step } => Arg::Slice {
                start: map_bound(start, f)?,
                stop: map_bound(stop, f)?,
                step: map_bound(step, f)?,
            },
        })
    }
}

fn map_bound<V, E, F>(bound: Option<Box<Arg<V>>>, f: &mut F) -> Result<Option<Box<Arg<V>>>, E>
where
    F: FnMut(NodeRef) -> Result<NodeRef, E>,
{
    bound
        .map(|arg| arg.try_map_nodes(f).map(Box::new))
        .transpose()
}

impl<V: TracedValue> Arg<V> {
    /// Produces the concrete value for this argument: node references go through `lookup`,
    /// containers and slices are rebuilt, and every located value is moved onto `device`.
    pub(crate) fn resolve<F>(&self, lookup: &mut F, device: Option<&Device>) -> Result<V>
    where
        F: FnMut(NodeRef) -> Result<V>,
    {
        match self {
            Arg::Node(node) => relocate(lookup(*node)?, device),
            Arg::Value(value) => relocate(value.clone(), device),
            Arg::List(items) => {
                let values = items
                    .iter()
                    .map(|item| item.resolve(lookup, device))
                    .collect::<Result<Vec<_>>>()?;
                Ok(V::list(values))
            }
            Arg::Dict(entries) => {
                let values = entries
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), item.resolve(lookup, device)?)))
                    .collect::<Result<Kwargs<_>>>()?;
                Ok(V::dict(values))
            }
            Arg::Slice { start, stop, step } => {
                let mut bound = |arg: &Option<Box<Arg<V>>>| {
                    arg.as_ref()
                        .map(|arg| arg.resolve(lookup, device))
                        .transpose()
                };
                let start = bound(start)?;
                let stop = bound(stop)?;
                let step = bound(step)?;
                V::slice(start, stop, step)
            }
        }
    }
}

fn relocate<V: TracedValue>(value: V, device: Option<&Device>) -> Result<V> {
    match (device, value.device()) {
        (Some(target), Some(current)) if &current != target => value.to_device(target),
        _ => Ok(value),
    }
}

impl<V: fmt::Debug> fmt::Display for Arg<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Node(node) => write!(f, "{node}"),
            Arg::Value(value) => write!(f, "{value:?}"),
            Arg::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Arg::Dict(entries) => {
                f.write_str("{")?;
                for (index, (key, item)) in entries.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                f.write_str("}")
            }
            Arg::Slice { start, stop, step } => {
                let bound = |arg: &Option<Box<Arg<V>>>| {
                    arg.as_ref().map(|arg| arg.to_string()).unwrap_or_default()
                };
                write!(f, "{}:{}:{}", bound(start), bound(stop), bound(step))
            }
        }
    }
}

/// Renders an argument list for error messages.
pub(crate) fn describe_args<V: fmt::Debug>(args: &[Arg<V>], kwargs: &Kwargs<Arg<V>>) -> String {
    let mut parts: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    parts.extend(kwargs.iter().map(|(key, arg)| format!("{key}={arg}")));
    parts.join(", ")
}

/// One recorded operation.
#[derive(Clone, Debug)]
pub struct Node<V> {
    pub(crate) id: NodeId,
    pub(crate) graph: GraphId,
    pub(crate) target: Target<V>,
    pub(crate) args: Vec<Arg<V>>,
    pub(crate) kwargs: Kwargs<Arg<V>>,
    pub(crate) proxy_value: Option<V>,
    pub(crate) device: Option<Device>,
}

impl<V> Node<V> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.graph, self.id)
    }

    pub fn target(&self) -> &Target<V> {
        &self.target
    }

    pub fn args(&self) -> &[Arg<V>] {
        &self.args
    }

    pub fn kwargs(&self) -> &Kwargs<Arg<V>> {
        &self.kwargs
    }

    pub fn proxy_value(&self) -> Option<&V> {
        self.proxy_value.as_ref()
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Nodes referenced by args and kwargs, in argument order.
    pub fn dependencies(&self) -> SmallVec<[NodeRef; 4]> {
        let mut out = SmallVec::new();
        for arg in &self.args {
            arg.collect_nodes(&mut out);
        }
        for arg in self.kwargs.values() {
            arg.collect_nodes(&mut out);
        }
        out
    }
}
