//! Scopes that own graphs while they are being traced and hand them to a backend on exit.
//!
//! A [`Tracer`] records one graph against one traced root. A [`Session`] groups several tracers
//! on a shared [`Bridge`](crate::graph::Bridge) so later graphs can read values produced by
//! earlier ones, and executes all of them together.

mod session;
mod tracer;

pub use session::Session;
pub use tracer::Tracer;
