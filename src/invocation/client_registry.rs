use std::fmt;

use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    channel::{MessageReceiver, SharedChannel},
    error::{ChannelError, InvocationError, RemoteErrorKind},
    message::{InvocationId, InvocationMessage, Progress, RequestId},
};

/// What happened to a call before it completed.
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationEvent {
    /// The server registered the call.
    Acknowledged,
    /// The server reported progress.
    Progress(Progress),
    /// The server asks a question that should be answered with
    /// [`Invocation::respond`](super::Invocation::respond).
    Request {
        /// Identifies the question.
        request_id: RequestId,
        /// The question.
        question: Value,
    },
}

pub(crate) type CallResult = Result<Value, InvocationError>;

struct PendingCall {
    method: String,
    result_tx: oneshot::Sender<CallResult>,
    events_tx: mpsc::UnboundedSender<InvocationEvent>,
}

/// Receivers of a registered call.
pub(crate) struct CallHandles {
    pub(crate) result_rx: oneshot::Receiver<CallResult>,
    pub(crate) events_rx: mpsc::UnboundedReceiver<InvocationEvent>,
}

/// The client's table of calls awaiting an answer.
///
/// Acts as the client transport's receiver: callbacks from the server are routed to the matching
/// call, and terminal messages complete and remove it.
#[derive(Default)]
pub struct InvocationClientServiceRegistry {
    pending: DashMap<InvocationId, PendingCall>,
}

impl InvocationClientServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        InvocationClientServiceRegistry::default()
    }

    /// Registers a call. Returns `None` if the id is already in use.
    pub(crate) fn register(&self, invocation_id: InvocationId, method: &str) -> Option<CallHandles> {
        match self.pending.entry(invocation_id) {
            Entry::Occupied(_) => {
                warn!(%invocation_id, method, "invocation id already pending");
                None
            }
            Entry::Vacant(entry) => {
                let (result_tx, result_rx) = oneshot::channel();
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                entry.insert(PendingCall {
                    method: method.to_string(),
                    result_tx,
                    events_tx,
                });
                trace!(%invocation_id, method, "registered pending call");
                Some(CallHandles { result_rx, events_rx })
            }
        }
    }

    /// Completes a pending call, removing it. Returns `false` if the call was not pending.
    pub(crate) fn complete(&self, invocation_id: &InvocationId, result: CallResult) -> bool {
        match self.pending.remove(invocation_id) {
            Some((_, call)) => {
                debug!(%invocation_id, method = %call.method, ok = result.is_ok(), "call completed");
                // The caller may have stopped waiting.
                let _ = call.result_tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Fails a pending call whose message could not be delivered.
    pub fn on_send_failure(&self, invocation_id: &InvocationId, err: ChannelError) {
        warn!(%invocation_id, error = %err, "invocation message not delivered");
        self.complete(invocation_id, Err(InvocationError::Channel(err)));
    }

    /// Fails every pending call, e.g. after the transport lost its connection.
    pub fn fail_all(&self, cause: impl Fn() -> ChannelError) {
        let ids: Vec<InvocationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), error = %cause(), "failing pending calls");
        }
        for invocation_id in ids {
            self.complete(&invocation_id, Err(InvocationError::Channel(cause())));
        }
    }

    /// Returns `true` while the call awaits an answer.
    pub fn is_pending(&self, invocation_id: &InvocationId) -> bool {
        self.pending.contains_key(invocation_id)
    }

    /// Number of calls awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn notify(&self, invocation_id: &InvocationId, event: InvocationEvent) {
        match self.pending.get(invocation_id) {
            Some(call) => {
                let _ = call.events_tx.send(event);
            }
            None => warn!(%invocation_id, "dropping event for unknown invocation"),
        }
    }
}

impl fmt::Debug for InvocationClientServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationClientServiceRegistry")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl MessageReceiver<InvocationMessage> for InvocationClientServiceRegistry {
    fn on_message(&self, message: InvocationMessage, _reply_channel: SharedChannel<InvocationMessage>) {
        let invocation_id = message.invocation_id();
        trace!(%invocation_id, kind = message.kind(), "client received message");

        match message {
            InvocationMessage::Acknowledge(_) => self.notify(&invocation_id, InvocationEvent::Acknowledged),
            InvocationMessage::Progress(msg) => self.notify(&invocation_id, InvocationEvent::Progress(msg.progress)),
            InvocationMessage::Request(msg) => self.notify(
                &invocation_id,
                InvocationEvent::Request {
                    request_id: msg.request_id,
                    question: msg.question,
                },
            ),
            InvocationMessage::Finished(msg) => {
                if !self.complete(&invocation_id, Ok(msg.result)) {
                    warn!(%invocation_id, "dropping result for unknown invocation");
                }
            }
            InvocationMessage::Exception(msg) => {
                let err = match msg.error.kind {
                    RemoteErrorKind::Canceled => InvocationError::Canceled,
                    _ => InvocationError::Remote(msg.error),
                };
                if !self.complete(&invocation_id, Err(err)) {
                    warn!(%invocation_id, "dropping error for unknown invocation");
                }
            }
            InvocationMessage::Cancel(_) => {
                self.complete(&invocation_id, Err(InvocationError::Canceled));
            }
            other => warn!(%invocation_id, kind = other.kind(), "client ignoring unexpected message"),
        }
    }

    fn on_disconnect(&self) {
        self.fail_all(|| ChannelError::ConnectionClosed);
    }
}
