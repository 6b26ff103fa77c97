use std::{fmt, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::{client_registry::CallResult, InvocationClientServiceRegistry, InvocationEvent};
use crate::{
    channel::SharedChannel,
    error::InvocationError,
    message::{
        CancelMessage, InvocationId, InvocationMessage, MethodInvocationMessage, RequestId,
        ResponseMessage,
    },
};

/// Builds and sends the client's half of the invocation protocol.
///
/// Every send failure is handed to the [`InvocationClientServiceRegistry`], which fails the affected
/// call. Nothing is retried.
#[derive(Clone)]
pub struct InvocationClient {
    channel: SharedChannel<InvocationMessage>,
    registry: Arc<InvocationClientServiceRegistry>,
    client_id: Option<String>,
}

impl InvocationClient {
    /// Creates a client sending over `channel`.
    pub fn new(
        channel: SharedChannel<InvocationMessage>,
        registry: Arc<InvocationClientServiceRegistry>,
    ) -> Self {
        InvocationClient {
            channel,
            registry,
            client_id: None,
        }
    }

    /// Identifies this client in every invocation it sends.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// The id this client identifies itself with.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// A handle invoking `method`.
    pub fn method(&self, method: impl Into<String>) -> MethodHandle {
        MethodHandle {
            client: self.clone(),
            method: method.into(),
        }
    }

    /// A handle canceling invocations.
    pub fn cancel_service(&self) -> CancelService {
        CancelService {
            channel: self.channel.clone(),
        }
    }

    /// A handle answering requests raised by running invocations.
    pub fn response_service(&self) -> ResponseService {
        ResponseService {
            client: self.clone(),
        }
    }
}

impl fmt::Debug for InvocationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationClient")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Invokes one method.
#[derive(Clone, Debug)]
pub struct MethodHandle {
    client: InvocationClient,
    method: String,
}

impl MethodHandle {
    /// The method's name.
    pub fn name(&self) -> &str {
        &self.method
    }

    /// Sends an invocation of this method.
    ///
    /// The caller owns `invocation_id` and should have registered it with the client service
    /// registry if it expects an answer.
    pub fn invoke(&self, invocation_id: InvocationId, parameter: Value) {
        let registry = self.client.registry.clone();
        trace!(%invocation_id, method = %self.method, "sending invocation");
        self.client.channel.send(
            MethodInvocationMessage {
                invocation_id,
                method_name: self.method.clone(),
                parameter,
                client_id: self.client.client_id.clone(),
            }
            .into(),
            Some(Box::new(move |err| registry.on_send_failure(&invocation_id, err))),
        );
    }
}

/// Cancels invocations.
#[derive(Clone)]
pub struct CancelService {
    channel: SharedChannel<InvocationMessage>,
}

impl CancelService {
    /// Asks the server to stop an invocation. Delivery failures are only logged.
    pub fn cancel(&self, invocation_id: InvocationId) {
        debug!(%invocation_id, "canceling invocation");
        self.channel.send(CancelMessage { invocation_id }.into(), None);
    }
}

impl fmt::Debug for CancelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelService").finish_non_exhaustive()
    }
}

/// Answers requests raised by running invocations.
#[derive(Clone, Debug)]
pub struct ResponseService {
    client: InvocationClient,
}

impl ResponseService {
    /// Sends the answer to `request_id`. A delivery failure fails the invocation.
    pub fn respond(&self, invocation_id: InvocationId, request_id: RequestId, payload: Value) {
        let registry = self.client.registry.clone();
        self.client.channel.send(
            ResponseMessage {
                invocation_id,
                request_id,
                payload,
            }
            .into(),
            Some(Box::new(move |err| registry.on_send_failure(&invocation_id, err))),
        );
    }
}

/// Calls remote methods and tracks their outcome.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use cap_remoting::config::SocketConfig;
/// use cap_remoting::invocation::{InvocationClientService, InvocationClientServiceRegistry};
/// use cap_remoting::message::InvocationMessage;
/// use cap_remoting::transport::socket::SocketClient;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(InvocationClientServiceRegistry::new());
/// let connection = SocketClient::<InvocationMessage>::connect(&SocketConfig::default(), registry.clone()).await?;
/// let service = InvocationClientService::new(connection.channel(), registry);
///
/// let sum: u32 = service.invoke("add", &(1, 2))?.result_as().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InvocationClientService {
    client: InvocationClient,
}

impl InvocationClientService {
    /// Creates a service sending over `channel`.
    ///
    /// `registry` must be the receiver of the transport `channel` belongs to.
    pub fn new(
        channel: SharedChannel<InvocationMessage>,
        registry: Arc<InvocationClientServiceRegistry>,
    ) -> Self {
        InvocationClientService {
            client: InvocationClient::new(channel, registry),
        }
    }

    /// Identifies this client in every invocation it sends.
    pub fn with_client_id(self, client_id: impl Into<String>) -> Self {
        InvocationClientService {
            client: self.client.with_client_id(client_id),
        }
    }

    /// The underlying protocol client.
    pub fn client(&self) -> &InvocationClient {
        &self.client
    }

    /// The registry of pending calls.
    pub fn registry(&self) -> &Arc<InvocationClientServiceRegistry> {
        &self.client.registry
    }

    /// Invokes `method` with `parameter`.
    pub fn invoke<P>(&self, method: &str, parameter: &P) -> Result<Invocation, InvocationError>
    where
        P: Serialize + ?Sized,
    {
        let parameter = serde_json::to_value(parameter)?;
        let invocation_id = InvocationId::new();
        let handles = self
            .client
            .registry
            .register(invocation_id, method)
            .ok_or(InvocationError::Abandoned)?;

        self.client.method(method).invoke(invocation_id, parameter);

        Ok(Invocation {
            invocation_id,
            method: method.to_string(),
            result_rx: handles.result_rx,
            events: handles.events_rx,
            client: self.client.clone(),
        })
    }
}

/// A call in flight.
///
/// Dropping the handle does not cancel the call; use [`Invocation::cancel`].
pub struct Invocation {
    invocation_id: InvocationId,
    method: String,
    result_rx: oneshot::Receiver<CallResult>,
    events: mpsc::UnboundedReceiver<InvocationEvent>,
    client: InvocationClient,
}

impl Invocation {
    /// The id correlating this call's messages.
    pub fn id(&self) -> InvocationId {
        self.invocation_id
    }

    /// The invoked method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Waits for the next event. Returns `None` once the call has completed.
    pub async fn next_event(&mut self) -> Option<InvocationEvent> {
        self.events.recv().await
    }

    /// Answers a request the server raised for this call.
    pub fn respond<T>(&self, request_id: RequestId, payload: &T) -> Result<(), InvocationError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.client
            .response_service()
            .respond(self.invocation_id, request_id, payload);
        Ok(())
    }

    /// Cancels the call. The server is told to stop and the call fails with
    /// [`InvocationError::Canceled`].
    pub fn cancel(self) {
        self.client.cancel_service().cancel(self.invocation_id);
        self.client
            .registry
            .complete(&self.invocation_id, Err(InvocationError::Canceled));
    }

    /// Waits for the result, ignoring events.
    ///
    /// Requests raised by the server go unanswered; use [`Invocation::complete_with`] for methods
    /// that ask questions.
    pub async fn result(self) -> Result<Value, InvocationError> {
        self.result_rx.await.unwrap_or(Err(InvocationError::Abandoned))
    }

    /// Waits for the result and converts it.
    pub async fn result_as<T: DeserializeOwned>(self) -> Result<T, InvocationError> {
        let value = self.result().await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Waits for the result, answering every request with `answer`.
    pub async fn complete_with<F>(self, mut answer: F) -> Result<Value, InvocationError>
    where
        F: FnMut(&Value) -> Value,
    {
        let Invocation {
            invocation_id,
            mut result_rx,
            mut events,
            client,
            ..
        } = self;
        let responses = client.response_service();

        loop {
            tokio::select! {
                result = &mut result_rx => return result.unwrap_or(Err(InvocationError::Abandoned)),
                Some(event) = events.recv() => {
                    if let InvocationEvent::Request { request_id, question } = event {
                        responses.respond(invocation_id, request_id, answer(&question));
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("invocation_id", &self.invocation_id)
            .field("method", &self.method)
            .finish()
    }
}
