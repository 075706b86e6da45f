//! Serializable form of graphs shipped to a remote executor.
//!
//! Functions travel by their whitelisted name; node references become indices into the same
//! graph, and bridge nodes name their source by run position within the request. Both JSON and
//! bincode encodings are supported.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WireEncoding;
use crate::graph::{Arg, Bridge, Graph, GraphId, NodeId, NodeRef, Operator, Protocol, Target};
use crate::registry::FunctionRegistry;
use crate::value::{Device, Kwargs, TracedValue};

pub const WIRE_VERSION: &str = "tracegraph-wire/1";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode encoding failed: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("unsupported wire version `{found}` (expected `{expected}`)")]
    Version { found: String, expected: String },
    #[error("function `{0}` is not whitelisted")]
    NotWhitelisted(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArgPayload<V> {
    Node(u32),
    Value(V),
    List(Vec<ArgPayload<V>>),
    Dict(BTreeMap<String, ArgPayload<V>>),
    Slice {
        start: Option<Box<ArgPayload<V>>>,
        stop: Option<Box<ArgPayload<V>>>,
        step: Option<Box<ArgPayload<V>>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPayload {
    Operator(Operator),
    Function(String),
    Root,
    Input { name: String },
    Literal,
    Bridge { run: u32, node: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePayload<V> {
    pub target: TargetPayload,
    pub args: Vec<ArgPayload<V>>,
    pub kwargs: BTreeMap<String, ArgPayload<V>>,
    pub device: Option<Device>,
    pub saved: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphPayload<V> {
    pub nodes: Vec<NodePayload<V>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunPayload<V> {
    pub graph: GraphPayload<V>,
    pub inputs: BTreeMap<String, V>,
    pub iterations: Option<Vec<V>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest<V> {
    pub version: String,
    pub model_key: String,
    pub runs: Vec<RunPayload<V>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult<V> {
    pub saved: Vec<(u32, V)>,
    pub iterations: Vec<Vec<(u32, V)>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RemoteResponse<V> {
    Completed { runs: Vec<RunResult<V>> },
    Failed { message: String },
}

pub fn encode<T: Serialize>(value: &T, encoding: WireEncoding) -> Result<Vec<u8>, WireError> {
    Ok(match encoding {
        WireEncoding::Json => serde_json::to_vec(value)?,
        WireEncoding::Bincode => bincode::serialize(value)?,
    })
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8], encoding: WireEncoding) -> Result<T, WireError> {
    Ok(match encoding {
        WireEncoding::Json => serde_json::from_slice(bytes)?,
        WireEncoding::Bincode => bincode::deserialize(bytes)?,
    })
}

impl<V> RemoteRequest<V> {
    pub fn new(model_key: impl Into<String>, runs: Vec<RunPayload<V>>) -> Self {
        RemoteRequest {
            version: WIRE_VERSION.to_string(),
            model_key: model_key.into(),
            runs,
        }
    }
}

impl<V: Serialize> RemoteRequest<V> {
    pub fn to_bytes(&self, encoding: WireEncoding) -> Result<Vec<u8>, WireError> {
        encode(self, encoding)
    }
}

impl<V: DeserializeOwned> RemoteRequest<V> {
    pub fn from_bytes(bytes: &[u8], encoding: WireEncoding) -> Result<Self, WireError> {
        let request: Self = decode(bytes, encoding)?;
        if request.version != WIRE_VERSION {
            return Err(WireError::Version {
                found: request.version,
                expected: WIRE_VERSION.to_string(),
            });
        }
        Ok(request)
    }
}

impl<V: Serialize> RemoteResponse<V> {
    pub fn to_bytes(&self, encoding: WireEncoding) -> Result<Vec<u8>, WireError> {
        encode(self, encoding)
    }
}

impl<V: DeserializeOwned> RemoteResponse<V> {
    pub fn from_bytes(bytes: &[u8], encoding: WireEncoding) -> Result<Self, WireError> {
        decode(bytes, encoding)
    }
}

/// Encodes `graph`. `run_of` gives the request position of any graph a bridge node reads from.
pub fn encode_graph<V: TracedValue>(
    graph: &Graph<V>,
    registry: &FunctionRegistry<V>,
    run_of: impl Fn(GraphId) -> Option<u32>,
) -> Result<GraphPayload<V>, WireError> {
    let mut nodes = Vec::with_capacity(graph.len());
    for node in graph.nodes() {
        let target = match node.target() {
            Target::Op(op) => TargetPayload::Operator(op.clone()),
            Target::Function(function) => TargetPayload::Function(
                registry
                    .canonical_name(function)
                    .ok_or_else(|| WireError::NotWhitelisted(function.name().to_string()))?
                    .to_string(),
            ),
            Target::Protocol(Protocol::Root) => TargetPayload::Root,
            Target::Protocol(Protocol::Input { name }) => TargetPayload::Input { name: name.clone() },
            Target::Protocol(Protocol::Literal) => TargetPayload::Literal,
            Target::Protocol(Protocol::Bridge { source }) => TargetPayload::Bridge {
                run: run_of(source.graph).ok_or_else(|| {
                    WireError::Malformed(format!(
                        "bridged node {source} comes from a graph outside the request"
                    ))
                })?,
                node: source.node.0,
            },
        };
        let mut args = node
            .args()
            .iter()
            .map(|arg| encode_arg(arg, graph.id()))
            .collect::<Result<Vec<_>, _>>()?;
        if matches!(target, TargetPayload::Literal) && args.is_empty() {
            if let Some(value) = node.proxy_value() {
                args.push(ArgPayload::Value(value.clone()));
            }
        }
        let kwargs = node
            .kwargs()
            .iter()
            .map(|(key, arg)| Ok((key.clone(), encode_arg(arg, graph.id())?)))
            .collect::<Result<BTreeMap<_, _>, WireError>>()?;
        nodes.push(NodePayload {
            target,
            args,
            kwargs,
            device: node.device().cloned(),
            saved: graph.is_saved(node.id()),
        });
    }
    Ok(GraphPayload { nodes })
}

fn encode_arg<V: TracedValue>(arg: &Arg<V>, graph: GraphId) -> Result<ArgPayload<V>, WireError> {
    let bound = |arg: &Option<Box<Arg<V>>>| {
        arg.as_ref()
            .map(|arg| encode_arg(arg, graph).map(Box::new))
            .transpose()
    };
    Ok(match arg {
        Arg::Node(node) if node.graph == graph => ArgPayload::Node(node.node.0),
        Arg::Node(node) => {
            return Err(WireError::Malformed(format!(
                "node {node} is referenced from graph {graph} without a bridge"
            )))
        }
        Arg::Value(value) => ArgPayload::Value(value.clone()),
        Arg::List(items) => ArgPayload::List(
            items
                .iter()
                .map(|item| encode_arg(item, graph))
                .collect::<Result<_, _>>()?,
        ),
        Arg::Dict(entries) => ArgPayload::Dict(
            entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), encode_arg(item, graph)?)))
                .collect::<Result<_, WireError>>()?,
        ),
        Arg::Slice { start, stop, step } => ArgPayload::Slice {
            start: bound(start)?,
            stop: bound(stop)?,
            step: bound(step)?,
        },
    })
}

/// Rebuilds a payload as a sealed graph registered on `bridge`, after `previous` (the graphs
/// decoded from earlier runs of the same request).
pub fn decode_graph<V: TracedValue>(
    payload: GraphPayload<V>,
    registry: &FunctionRegistry<V>,
    bridge: &Arc<Bridge<V>>,
    previous: &[Arc<Graph<V>>],
) -> Result<Arc<Graph<V>>, WireError> {
    let graph = Graph::new(false);
    let scope = bridge.enter(&graph);
    for node in payload.nodes {
        let mut bridged_from = None;
        let target = match node.target {
            TargetPayload::Operator(op) => Target::Op(op),
            TargetPayload::Function(name) => Target::Function(
                registry
                    .resolve(&name)
                    .ok_or(WireError::UnknownFunction(name))?,
            ),
            TargetPayload::Root => Target::Protocol(Protocol::Root),
            TargetPayload::Input { name } => Target::Protocol(Protocol::Input { name }),
            TargetPayload::Literal => Target::Protocol(Protocol::Literal),
            TargetPayload::Bridge { run, node } => {
                let source_graph = previous.get(run as usize).ok_or_else(|| {
                    WireError::Malformed(format!("bridge reads from run {run}, which precedes no graph"))
                })?;
                let source = NodeRef::new(source_graph.id(), NodeId(node));
                bridged_from = Some(source);
                Target::Protocol(Protocol::Bridge { source })
            }
        };
        let args = node
            .args
            .into_iter()
            .map(|arg| decode_arg(arg, graph.id()))
            .collect::<Vec<_>>();
        let kwargs = node
            .kwargs
            .into_iter()
            .map(|(key, arg)| (key, decode_arg(arg, graph.id())))
            .collect::<Kwargs<_>>();
        let id = graph
            .push_decoded(target, args, kwargs, node.device, node.saved)
            .map_err(|err| WireError::Malformed(err.to_string()))?;
        if let Some(source) = bridged_from {
            bridge
                .add_bridge_node(source, NodeRef::new(graph.id(), id))
                .map_err(|err| WireError::Malformed(err.to_string()))?;
        }
    }
    scope.close();
    graph.seal();
    Ok(graph)
}

fn decode_arg<V>(arg: ArgPayload<V>, graph: GraphId) -> Arg<V> {
    let bound = |arg: Option<Box<ArgPayload<V>>>| arg.map(|arg| Box::new(decode_arg(*arg, graph)));
    match arg {
        ArgPayload::Node(node) => Arg::Node(NodeRef::new(graph, NodeId(node))),
        ArgPayload::Value(value) => Arg::Value(value),
        ArgPayload::List(items) => {
            Arg::List(items.into_iter().map(|item| decode_arg(item, graph)).collect())
        }
        ArgPayload::Dict(entries) => Arg::Dict(
            entries
                .into_iter()
                .map(|(key, item)| (key, decode_arg(item, graph)))
                .collect(),
        ),
        ArgPayload::Slice { start, stop, step } => Arg::Slice {
            start: bound(start),
            stop: bound(stop),
            step: bound(step),
        },
    }
}

/// Writes a run's results back onto the graph it was encoded from.
pub(crate) fn apply_run_result<V: TracedValue>(
    graph: &Graph<V>,
    result: RunResult<V>,
) -> Result<(), WireError> {
    for (node, value) in result.saved {
        if !graph.set_value(NodeId(node), value) {
            return Err(WireError::Malformed(format!(
                "result names node %{node}, which graph {} does not have",
                graph.id()
            )));
        }
    }
    graph.clear_iterations();
    for iteration in result.iterations {
        graph.push_iteration(
            iteration
                .into_iter()
                .map(|(node, value)| (NodeId(node), value))
                .collect(),
        );
    }
    Ok(())
}

/// Saved values and iteration history of an executed graph, in wire form.
pub(crate) fn collect_run_result<V: TracedValue>(graph: &Graph<V>) -> RunResult<V> {
    let saved = graph
        .saved_values()
        .into_iter()
        .map(|(node, value)| (node.0, value))
        .collect();
    let iterations = graph
        .iterations()
        .into_iter()
        .map(|values| {
            values
                .into_iter()
                .map(|(node, value)| (node.0, value))
                .collect()
        })
        .collect();
    RunResult { saved, iterations }
}
