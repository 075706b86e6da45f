use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::BackendResult;
use crate::value::TracedValue;

use super::interpreter::GraphRun;
use super::Backend;

/// Runs deferred by tracers opened inside a session, in the order their scopes closed.
pub struct SessionQueue<V> {
    runs: Arc<Mutex<Vec<GraphRun<V>>>>,
}

impl<V> Clone for SessionQueue<V> {
    fn clone(&self) -> Self {
        SessionQueue {
            runs: Arc::clone(&self.runs),
        }
    }
}

impl<V: TracedValue> SessionQueue<V> {
    pub fn new() -> Self {
        SessionQueue {
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, run: GraphRun<V>) {
        self.lock().push(run);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<GraphRun<V>> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GraphRun<V>>> {
        self.runs.lock().expect("session queue poisoned")
    }
}

impl<V: TracedValue> Default for SessionQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Contexts that can hand their work to an enclosing session.
pub trait SessionMixin<V> {
    fn session_backend_handle(&mut self, queue: &SessionQueue<V>) -> BackendResult<()>;
}

/// Backend given to tracers opened inside a session: nothing runs when the tracer exits; its
/// graph joins the session queue and executes with the others once the session exits.
pub struct SessionBackend<V> {
    queue: SessionQueue<V>,
}

impl<V: TracedValue> SessionBackend<V> {
    pub const NAME: &'static str = "session";

    pub fn new(queue: SessionQueue<V>) -> Self {
        SessionBackend { queue }
    }
}

impl<V: TracedValue, C: SessionMixin<V> + ?Sized> Backend<C> for SessionBackend<V> {
    fn backend_name(&self) -> &str {
        Self::NAME
    }

    fn execute(&self, context: &mut C) -> BackendResult<()> {
        context.session_backend_handle(&self.queue)?;
        debug!(queued = self.queue.len(), "deferred graph into session");
        Ok(())
    }
}
