//! Off-process execution through a pluggable transport.
//!
//! The context is encoded through the function whitelist into a [`RemoteRequest`], sent over a
//! [`RemoteTransport`] under a timeout and a cancellation token, and the returned saved values
//! are written back onto the local graphs. Failures at this layer are recoverable: the local
//! graphs are only touched once a complete response arrived.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{RemoteConfig, WireEncoding};
use crate::error::{BackendError, BackendResult};
use crate::graph::{Bridge, Graph};
use crate::registry::FunctionRegistry;
use crate::value::TracedValue;

use super::interpreter::{self, GraphRun};
use super::wire::{self, RemoteRequest, RemoteResponse, RunResult, WireError};
use super::Backend;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

/// Moves encoded requests to an executor and brings the encoded response back.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// Contexts that can be shipped to a remote executor.
pub trait RemoteMixin<V> {
    fn remote_backend_request(
        &self,
        model_key: &str,
        registry: &FunctionRegistry<V>,
    ) -> BackendResult<RemoteRequest<V>>;

    fn remote_backend_handle_result(&mut self, runs: Vec<RunResult<V>>) -> BackendResult<()>;
}

pub struct RemoteBackend<V> {
    model_key: String,
    registry: Arc<FunctionRegistry<V>>,
    transport: Arc<dyn RemoteTransport>,
    config: RemoteConfig,
    /// Token of the current request; replaced once it has been cancelled.
    cancel: Mutex<CancellationToken>,
}

impl<V> RemoteBackend<V>
where
    V: TracedValue + Serialize + DeserializeOwned,
{
    pub const NAME: &'static str = "remote";

    pub fn new(
        model_key: impl Into<String>,
        registry: Arc<FunctionRegistry<V>>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        RemoteBackend {
            model_key: model_key.into(),
            registry,
            transport,
            config: RemoteConfig::default(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_config(mut self, config: RemoteConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Token that aborts the in-flight request when cancelled. A token cancelled while no
    /// request is running is discarded when the next request starts, so fetch a fresh one
    /// after each cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_slot().clone()
    }

    /// Aborts the in-flight request, if any. Later requests are unaffected.
    pub fn cancel(&self) {
        self.cancel_slot().cancel();
    }

    fn request_token(&self) -> CancellationToken {
        let mut slot = self.cancel_slot();
        if slot.is_cancelled() {
            *slot = CancellationToken::new();
        }
        slot.clone()
    }

    fn cancel_slot(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().expect("cancellation slot poisoned")
    }

    /// Async entry point for callers already inside a tokio runtime.
    pub async fn execute_async<C>(&self, context: &mut C) -> BackendResult<()>
    where
        C: RemoteMixin<V> + ?Sized,
    {
        let request = context.remote_backend_request(&self.model_key, &self.registry)?;
        let payload = request.to_bytes(self.config.encoding)?;
        debug!(
            model = %self.model_key,
            runs = request.runs.len(),
            bytes = payload.len(),
            "sending remote request"
        );
        let reply = self.submit(payload).await?;
        match RemoteResponse::<V>::from_bytes(&reply, self.config.encoding)? {
            RemoteResponse::Completed { runs } => context.remote_backend_handle_result(runs),
            RemoteResponse::Failed { message } => Err(BackendError::Remote(message)),
        }
    }

    async fn submit(&self, payload: Vec<u8>) -> BackendResult<Vec<u8>> {
        let timeout = self.config.timeout();
        let cancel = self.request_token();
        tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.send(payload)) => match result {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(err)) => Err(BackendError::Transport(err.to_string())),
                Err(_) => {
                    warn!(?timeout, model = %self.model_key, "remote request timed out");
                    Err(BackendError::Timeout(timeout))
                }
            },
            _ = cancel.cancelled() => {
                warn!(model = %self.model_key, "remote request cancelled");
                Err(BackendError::Cancelled)
            }
        }
    }
}

impl<V, C> Backend<C> for RemoteBackend<V>
where
    V: TracedValue + Serialize + DeserializeOwned,
    C: RemoteMixin<V> + ?Sized,
{
    fn backend_name(&self) -> &str {
        Self::NAME
    }

    /// Blocks on a private current-thread runtime. Inside a runtime use
    /// [`RemoteBackend::execute_async`].
    fn execute(&self, context: &mut C) -> BackendResult<()> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(BackendError::execution(
                "remote backend cannot block inside a tokio runtime; use execute_async",
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        runtime.block_on(self.execute_async(context))
    }
}

/// Executes requests against models it holds by key.
pub struct RemoteExecutor<V> {
    models: HashMap<String, V>,
    registry: Arc<FunctionRegistry<V>>,
    encoding: WireEncoding,
}

impl<V> RemoteExecutor<V>
where
    V: TracedValue + Serialize + DeserializeOwned,
{
    pub fn new(registry: Arc<FunctionRegistry<V>>, encoding: WireEncoding) -> Self {
        RemoteExecutor {
            models: HashMap::new(),
            registry,
            encoding,
        }
    }

    pub fn with_model(mut self, key: impl Into<String>, model: V) -> Self {
        self.models.insert(key.into(), model);
        self
    }

    pub fn handle(&self, request: RemoteRequest<V>) -> RemoteResponse<V> {
        match self.try_handle(request) {
            Ok(runs) => RemoteResponse::Completed { runs },
            Err(err) => {
                warn!(error = %err, "remote execution failed");
                RemoteResponse::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Decodes, executes and re-encodes. Undecodable requests get a `Failed` response.
    pub fn handle_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
        let response = match RemoteRequest::from_bytes(bytes, self.encoding) {
            Ok(request) => self.handle(request),
            Err(err) => RemoteResponse::Failed {
                message: err.to_string(),
            },
        };
        response.to_bytes(self.encoding)
    }

    fn try_handle(&self, request: RemoteRequest<V>) -> BackendResult<Vec<RunResult<V>>> {
        let model = self.models.get(&request.model_key).ok_or_else(|| {
            BackendError::execution(format!("unknown model `{}`", request.model_key))
        })?;
        let bridge = Bridge::new();
        let mut graphs: Vec<Arc<Graph<V>>> = Vec::with_capacity(request.runs.len());
        let mut runs = Vec::with_capacity(request.runs.len());
        for payload in request.runs {
            let graph = wire::decode_graph(payload.graph, &self.registry, &bridge, &graphs)?;
            graphs.push(Arc::clone(&graph));
            runs.push(GraphRun {
                graph,
                root: Some(model.clone()),
                inputs: payload.inputs,
                iterations: payload.iterations,
            });
        }
        interpreter::execute_queue(&runs, &bridge, RemoteBackend::<V>::NAME)?;
        let results = runs
            .iter()
            .map(|run| wire::collect_run_result(&run.graph))
            .collect();
        bridge.teardown()?;
        Ok(results)
    }
}

/// In-process transport that hands requests straight to a [`RemoteExecutor`].
pub struct LoopbackTransport<V> {
    executor: Arc<RemoteExecutor<V>>,
    latency: Option<Duration>,
}

impl<V> LoopbackTransport<V> {
    pub fn new(executor: Arc<RemoteExecutor<V>>) -> Self {
        LoopbackTransport {
            executor,
            latency: None,
        }
    }

    /// Delays every response, as a slow network would.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl<V> RemoteTransport for LoopbackTransport<V>
where
    V: TracedValue + Serialize + DeserializeOwned,
{
    async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || executor.handle_bytes(&payload))
            .await
            .map_err(|err| TransportError::Failed(err.to_string()))?
            .map_err(|err| TransportError::Failed(err.to_string()))
    }
}
