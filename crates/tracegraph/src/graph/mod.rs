//! Deferred operation graphs: nodes, the proxies that record them, and the bridge that lets
//! graphs opened together exchange values.

mod arena;
pub mod bridge;
pub mod node;
pub mod protocol;
pub mod proxy;
mod state;

pub use arena::Graph;
pub use bridge::{Bridge, GraphScope};
pub use node::{Arg, GraphId, Node, NodeId, NodeRef, Operator, Target};
pub use protocol::{Protocol, ITERATION_INPUT};
pub use proxy::Proxy;
