use tracing::debug;

use crate::error::BackendResult;

use super::Backend;

/// Contexts that can execute themselves synchronously in-process.
pub trait LocalMixin {
    fn local_backend_execute(&mut self) -> BackendResult<()>;
}

/// Runs every node in creation order on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub const NAME: &'static str = "local";
}

impl<C: LocalMixin + ?Sized> Backend<C> for LocalBackend {
    fn backend_name(&self) -> &str {
        Self::NAME
    }

    fn execute(&self, context: &mut C) -> BackendResult<()> {
        debug!(backend = Self::NAME, "executing context");
        context.local_backend_execute()
    }
}
