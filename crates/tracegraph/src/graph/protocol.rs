//! Special node targets with their own creation and execution logic.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::backend::interpreter::ExecutionEnv;
use crate::error::TraceError;
use crate::value::{Kwargs, TracedValue};

use super::bridge::Bridge;
use super::node::{Node, NodeRef, Target};
use super::Graph;

/// Input name bound to the current item while an iterating graph runs.
pub const ITERATION_INPUT: &str = "__iter__";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// The traced object itself.
    Root,
    /// A named input supplied when the graph executes.
    Input { name: String },
    /// A constant: its first argument, or the recorded value when it has none.
    Literal,
    /// A value produced by `source` in an earlier graph on the same bridge.
    Bridge { source: NodeRef },
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Root => "root",
            Protocol::Input { .. } => "input",
            Protocol::Literal => "literal",
            Protocol::Bridge { .. } => "bridge",
        }
    }

    pub(crate) fn execute<V: TracedValue>(
        &self,
        node: &Node<V>,
        args: &[V],
        env: &ExecutionEnv<'_, V>,
    ) -> Result<V> {
        match self {
            Protocol::Root => env
                .root
                .cloned()
                .ok_or_else(|| anyhow!("no traced object is bound for execution")),
            Protocol::Input { name } => env
                .inputs
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("input `{name}` was not provided")),
            Protocol::Literal => match args.first() {
                Some(value) => Ok(value.clone()),
                None => node
                    .proxy_value()
                    .cloned()
                    .ok_or_else(|| anyhow!("literal {} carries no value", node.node_ref())),
            },
            Protocol::Bridge { source } => {
                let bridge = env
                    .bridge
                    .ok_or_else(|| anyhow!("bridge node {} executed without a bridge", node.id()))?;
                bridge.bridged_value(*source, node.graph(), env.consume_bridged)
            }
        }
    }
}

/// Creates the node in `graph` that stands for `source` and registers it with `bridge`.
pub(crate) fn add_bridge_node<V: TracedValue>(
    graph: &Arc<Graph<V>>,
    bridge: &Bridge<V>,
    source: NodeRef,
    proxy_value: Option<V>,
) -> Result<NodeRef, TraceError> {
    let id = graph.append(
        proxy_value,
        Target::Protocol(Protocol::Bridge { source }),
        Vec::new(),
        Kwargs::new(),
    )?;
    let bridge_node = NodeRef::new(graph.id(), id);
    bridge.add_bridge_node(source, bridge_node)?;
    Ok(bridge_node)
}
