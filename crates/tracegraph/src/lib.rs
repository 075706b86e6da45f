//! Deferred-execution tracing for proxied values.
//!
//! Operations performed on a [`Proxy`] are recorded as nodes of a [`Graph`] instead of being
//! run. A completed graph is handed to a backend that executes it in-process, once per item of
//! an iteration, grouped with other graphs in a [`Session`], or on a remote executor. Graphs
//! opened in the same session share a [`Bridge`], which lets later graphs consume values that
//! earlier graphs produce.
//!
//! The values being traced are supplied by the caller through the [`TracedValue`] trait.

mod env;
mod macros;

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod registry;
pub mod trace;
pub mod value;

pub use backend::{
    Backend, IteratorBackend, LocalBackend, LoopbackTransport, RemoteBackend, RemoteExecutor,
    RemoteTransport, SessionBackend,
};
pub use config::{RemoteConfig, TraceConfig, WireEncoding};
pub use context::{Session, Tracer};
pub use error::{BackendError, BackendResult, TraceError};
pub use graph::{Arg, Bridge, Graph, GraphId, Node, NodeId, NodeRef, Operator, Protocol, Proxy, Target};
pub use registry::{FunctionRef, FunctionRegistry};
pub use value::{BinaryOp, Device, Kwargs, Method, NativeFn, TracedValue};
