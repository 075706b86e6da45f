//! Execution strategies for completed tracing contexts.
//!
//! A [`Backend`] is handed a context (a [`Tracer`](crate::context::Tracer) or a
//! [`Session`](crate::context::Session)) when its scope closes. Contexts opt into each
//! strategy by implementing the matching mixin trait:
//!
//! | backend | mixin | behaviour |
//! |---|---|---|
//! | [`LocalBackend`] | [`LocalMixin`] | run in-process, in creation order |
//! | [`IteratorBackend`] | [`IteratorMixin`] | run once per iteration item |
//! | [`SessionBackend`] | [`SessionMixin`] | defer into the enclosing session |
//! | [`RemoteBackend`] | [`RemoteMixin`] | ship through the wire format and await results |

pub(crate) mod interpreter;
pub mod iterator;
pub mod local;
pub mod remote;
pub mod session;
pub mod wire;

pub use interpreter::GraphRun;
pub use iterator::{IteratorBackend, IteratorMixin};
pub use local::{LocalBackend, LocalMixin};
pub use remote::{
    LoopbackTransport, RemoteBackend, RemoteExecutor, RemoteMixin, RemoteTransport, TransportError,
};
pub use session::{SessionBackend, SessionMixin, SessionQueue};

use crate::error::BackendResult;

/// Strategy that executes a context of type `C`.
pub trait Backend<C: ?Sized>: Send + Sync {
    fn backend_name(&self) -> &str;

    fn execute(&self, context: &mut C) -> BackendResult<()>;
}
