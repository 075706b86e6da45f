use tracing::debug;

use crate::error::BackendResult;

use super::Backend;

/// Contexts whose graph re-runs once per item of an iteration input.
pub trait IteratorMixin {
    fn iterator_backend_execute(&mut self) -> BackendResult<()>;
}

/// Re-enters the same graph for every item; the graph keeps its bridge registration, so
/// cross-graph ties are resolved once and read on each pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct IteratorBackend;

impl IteratorBackend {
    pub const NAME: &'static str = "iterator";
}

impl<C: IteratorMixin + ?Sized> Backend<C> for IteratorBackend {
    fn backend_name(&self) -> &str {
        Self::NAME
    }

    fn execute(&self, context: &mut C) -> BackendResult<()> {
        debug!(backend = Self::NAME, "executing context");
        context.iterator_backend_execute()
    }
}
