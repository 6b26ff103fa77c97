use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{interceptor_by_name, ExecutionInterceptor, PendingInvocations};
use crate::{
    config::InvocationServerConfig,
    error::{ConfigError, RemoteError},
    message::{
        ExceptionMessage, FinishedMessage, InvocationId, InvocationMessage, MethodInvocationMessage,
        Progress, ProgressMessage, RequestId, RequestMessage, ResponseMessage,
    },
};

/// A method callable through invocations.
pub trait MethodService: Send + Sync + 'static {
    /// Executes the method.
    ///
    /// Cancellation is cooperative: long running services should check
    /// [`ExecutionContext::is_canceled`] or select on [`ExecutionContext::canceled`].
    fn execute(&self, ctx: ExecutionContext, parameter: Value) -> BoxFuture<'static, Result<Value, RemoteError>>;
}

/// Creates a [`MethodService`] from an async closure.
///
/// ```
/// use cap_remoting::{error::RemoteError, invocation::service_fn};
///
/// let echo = service_fn(|_ctx, parameter| async move { Ok::<_, RemoteError>(parameter) });
/// ```
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    ServiceFn { f }
}

/// A [`MethodService`] backed by a closure, created with [`service_fn`].
pub struct ServiceFn<F> {
    f: F,
}

impl<F, Fut> MethodService for ServiceFn<F>
where
    F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    fn execute(&self, ctx: ExecutionContext, parameter: Value) -> BoxFuture<'static, Result<Value, RemoteError>> {
        (self.f)(ctx, parameter).boxed()
    }
}

impl<F> fmt::Debug for ServiceFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFn").finish_non_exhaustive()
    }
}

struct ContextInner {
    invocation_id: InvocationId,
    method: String,
    client_id: Option<String>,
    started_at: Instant,
    cancellation: CancellationToken,
    pending: Arc<PendingInvocations>,
    requests: DashMap<RequestId, oneshot::Sender<Value>>,
}

/// The view a running method has of its invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    fn new(invoke: &MethodInvocationMessage, pending: Arc<PendingInvocations>) -> Self {
        ExecutionContext {
            inner: Arc::new(ContextInner {
                invocation_id: invoke.invocation_id,
                method: invoke.method_name.clone(),
                client_id: invoke.client_id.clone(),
                started_at: Instant::now(),
                cancellation: CancellationToken::new(),
                pending,
                requests: DashMap::new(),
            }),
        }
    }

    /// The invocation being executed.
    pub fn invocation_id(&self) -> InvocationId {
        self.inner.invocation_id
    }

    /// The invoked method's name.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// The id the client identified itself with, if any.
    pub fn client_id(&self) -> Option<&str> {
        self.inner.client_id.as_deref()
    }

    /// Time since the execution started.
    pub fn elapsed(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Returns `true` once the invocation has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Completes when the invocation is canceled.
    pub async fn canceled(&self) {
        self.inner.cancellation.cancelled().await
    }

    fn cancel(&self) {
        self.inner.cancellation.cancel();
        // Dropping the senders fails outstanding requests.
        self.inner.requests.clear();
    }

    /// Reports progress to the caller.
    ///
    /// Ignored once the invocation is no longer pending.
    pub fn set_progress(&self, progress: Progress) {
        let invocation_id = self.inner.invocation_id;
        if let Some(channel) = self.inner.pending.reply_channel(&invocation_id) {
            channel.send(ProgressMessage { invocation_id, progress }.into(), None);
        }
    }

    /// Asks the caller a question and waits for the answer.
    ///
    /// Fails if the invocation is canceled, is no longer pending, or the question cannot be
    /// delivered.
    pub async fn request(&self, question: Value) -> Result<Value, RemoteError> {
        let invocation_id = self.inner.invocation_id;
        let Some(channel) = self.inner.pending.reply_channel(&invocation_id) else {
            return Err(RemoteError::canceled());
        };

        let request_id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.inner.requests.insert(request_id, tx);
        if self.is_canceled() {
            self.inner.requests.remove(&request_id);
            return Err(RemoteError::canceled());
        }

        let inner = self.inner.clone();
        channel.send(
            RequestMessage {
                invocation_id,
                request_id,
                question,
            }
            .into(),
            Some(Box::new(move |err| {
                warn!(%invocation_id, %request_id, error = %err, "failed to deliver request");
                inner.requests.remove(&request_id);
            })),
        );
        trace!(%invocation_id, %request_id, "waiting for response");

        tokio::select! {
            answer = rx => answer.map_err(|_| {
                if self.is_canceled() {
                    RemoteError::canceled()
                } else {
                    RemoteError::service_failure("request could not be delivered")
                }
            }),
            _ = self.canceled() => Err(RemoteError::canceled()),
        }
    }

    fn resolve_request(&self, request_id: &RequestId, payload: Value) -> bool {
        match self.inner.requests.remove(request_id) {
            Some((_, tx)) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    fn complete(&self, result: Result<Value, RemoteError>) {
        let invocation_id = self.inner.invocation_id;
        let Some(channel) = self.inner.pending.unregister(&invocation_id) else {
            debug!(%invocation_id, "discarding result of invocation no longer pending");
            return;
        };

        let message: InvocationMessage = match result {
            Ok(result) => FinishedMessage { invocation_id, result }.into(),
            Err(error) => ExceptionMessage { invocation_id, error }.into(),
        };
        channel.send(message, None);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("invocation_id", &self.inner.invocation_id)
            .field("method", &self.inner.method)
            .field("client_id", &self.inner.client_id)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Maps method names to services and runs invocations.
///
/// Every invocation runs in its own task. Its [`ExecutionContext`] stays registered until the
/// service returns, so cancels and responses can reach it.
pub struct InvocationServerServiceRegistry {
    services: DashMap<String, Arc<dyn MethodService>>,
    interceptors: Vec<Arc<dyn ExecutionInterceptor>>,
    pending: Arc<PendingInvocations>,
    running: DashMap<InvocationId, ExecutionContext>,
}

impl InvocationServerServiceRegistry {
    /// Creates a registry without services or interceptors.
    pub fn new() -> Self {
        InvocationServerServiceRegistry {
            services: DashMap::new(),
            interceptors: Vec::new(),
            pending: Arc::new(PendingInvocations::new()),
            running: DashMap::new(),
        }
    }

    /// Creates a registry with the interceptors named in `config`.
    pub fn from_config(config: &InvocationServerConfig) -> Result<Self, ConfigError> {
        config
            .execution_interceptors
            .iter()
            .try_fold(InvocationServerServiceRegistry::new(), |registry, name| {
                Ok(registry.with_interceptor(interceptor_by_name(name)?))
            })
    }

    /// Adds an interceptor. Interceptors run in the order they were added.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ExecutionInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Registers a service under `method`, returning the service it replaces.
    pub fn register_method(
        &self,
        method: impl Into<String>,
        service: impl MethodService,
    ) -> Option<Arc<dyn MethodService>> {
        let method = method.into();
        debug!(%method, "registered method");
        self.services.insert(method, Arc::new(service))
    }

    /// Removes the service registered under `method`.
    pub fn unregister_method(&self, method: &str) -> Option<Arc<dyn MethodService>> {
        self.services.remove(method).map(|(_, service)| service)
    }

    /// Returns `true` if a service is registered under `method`.
    pub fn has_method(&self, method: &str) -> bool {
        self.services.contains_key(method)
    }

    /// The invocations awaiting an answer.
    pub fn pending(&self) -> &Arc<PendingInvocations> {
        &self.pending
    }

    /// Number of executions still running.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Starts executing an invocation.
    ///
    /// The result is sent to the caller unless the invocation was unregistered in the meantime.
    /// Must be called within a tokio runtime.
    pub fn on_method_invocation(self: &Arc<Self>, invoke: MethodInvocationMessage) {
        let invocation_id = invoke.invocation_id;
        let ctx = ExecutionContext::new(&invoke, self.pending.clone());
        self.running.insert(invocation_id, ctx.clone());
        let service = self
            .services
            .get(&invoke.method_name)
            .map(|entry| entry.value().clone());

        let registry = self.clone();
        tokio::spawn(async move {
            let result = registry.execute(&ctx, service, invoke.parameter).await;
            registry.running.remove(&invocation_id);
            ctx.complete(result);
        });
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        service: Option<Arc<dyn MethodService>>,
        parameter: Value,
    ) -> Result<Value, RemoteError> {
        for interceptor in &self.interceptors {
            interceptor.before_execution(ctx)?;
        }

        let result = match service {
            Some(service) => {
                match AssertUnwindSafe(service.execute(ctx.clone(), parameter))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        error!(invocation_id = %ctx.invocation_id(), method = ctx.method(), "service panicked");
                        Err(RemoteError::service_failure("service panicked"))
                    }
                }
            }
            None => Err(RemoteError::unknown_method(ctx.method())),
        };

        for interceptor in self.interceptors.iter().rev() {
            interceptor.after_execution(ctx, &result);
        }
        result
    }

    /// Signals cancellation to a running invocation.
    pub fn on_cancel(&self, invocation_id: &InvocationId) {
        match self.running.get(invocation_id) {
            Some(ctx) => {
                debug!(%invocation_id, "canceling execution");
                ctx.cancel();
            }
            None => trace!(%invocation_id, "cancel for invocation not running"),
        }
    }

    /// Delivers a caller's answer to the execution that asked for it.
    pub fn on_response(&self, response: ResponseMessage) {
        let ResponseMessage {
            invocation_id,
            request_id,
            payload,
        } = response;
        let resolved = self
            .running
            .get(&invocation_id)
            .map(|ctx| ctx.resolve_request(&request_id, payload))
            .unwrap_or(false);
        if !resolved {
            warn!(%invocation_id, %request_id, "dropping response to unknown request");
        }
    }
}

impl Default for InvocationServerServiceRegistry {
    fn default() -> Self {
        InvocationServerServiceRegistry::new()
    }
}

impl fmt::Debug for InvocationServerServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationServerServiceRegistry")
            .field("methods", &self.services.len())
            .field("interceptors", &self.interceptors.len())
            .field("pending", &self.pending.len())
            .field("running", &self.running.len())
            .finish()
    }
}
