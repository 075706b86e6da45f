use std::time::Duration;

use thiserror::Error;

use crate::backend::wire::WireError;
use crate::graph::{GraphId, NodeId, NodeRef};

/// Structural failures raised while recording, before anything runs.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("`{target}` failed against proxy values ({args}): {source}")]
    Structural {
        target: String,
        args: String,
        source: anyhow::Error,
    },
    #[error("arguments for `{target}` could not be resolved: {source}")]
    Unresolvable {
        target: String,
        source: anyhow::Error,
    },
    #[error("node {node} is not registered in graph {graph}")]
    UnknownNode { graph: GraphId, node: NodeId },
    #[error("node {node} has no proxy value; tracing ran without validation")]
    MissingProxyValue { node: NodeRef },
    #[error("coercing node {node} failed: {source}")]
    Coercion { node: NodeRef, source: anyhow::Error },
    #[error("graph {graph} cannot read node {node}: the graphs share no bridge")]
    Unbridged { graph: GraphId, node: NodeRef },
    #[error("graph {graph} cannot read node {node}: its graph was not registered earlier")]
    TemporalOrder { graph: GraphId, node: NodeRef },
    #[error("node {node} already has a representation in graph {graph}")]
    DuplicateBridgeNode { node: NodeRef, graph: GraphId },
    #[error("graph {0} is sealed and accepts no further nodes")]
    Sealed(GraphId),
    #[error("iteration requires at least one item")]
    EmptyIteration,
}

/// Failures raised while a backend executes a graph.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("node {node} (`{target}`) failed during execution: {source}")]
    Node {
        node: NodeRef,
        target: String,
        source: anyhow::Error,
    },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
    #[error("bridge still holds {locks} cross-graph lock(s)")]
    BridgeLocked { locks: usize },
    #[error("remote request timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote request was cancelled")]
    Cancelled,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote execution failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl BackendError {
    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    /// Remote failures leave the recorded graph untouched; the caller may retry or execute it
    /// with a different backend.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::Cancelled
                | BackendError::Transport(_)
                | BackendError::Remote(_)
        )
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
