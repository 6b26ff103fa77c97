use std::{fmt, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, trace, warn};

use super::InvocationServerServiceRegistry;
use crate::{
    channel::{MessageReceiver, SharedChannel},
    message::{AcknowledgeMessage, InvocationId, InvocationMessage},
};

/// Invocations the server has accepted and not yet answered, with the channel that reaches each
/// caller.
#[derive(Default)]
pub struct PendingInvocations {
    entries: DashMap<InvocationId, SharedChannel<InvocationMessage>>,
}

impl PendingInvocations {
    /// Creates an empty registry.
    pub fn new() -> Self {
        PendingInvocations::default()
    }

    /// Registers an invocation.
    ///
    /// Returns `false` without touching the existing entry if the id is already registered.
    pub fn register(
        &self,
        invocation_id: InvocationId,
        reply_channel: SharedChannel<InvocationMessage>,
    ) -> bool {
        match self.entries.entry(invocation_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(reply_channel);
                true
            }
        }
    }

    /// Removes an invocation, returning its reply channel if it was registered.
    pub fn unregister(&self, invocation_id: &InvocationId) -> Option<SharedChannel<InvocationMessage>> {
        self.entries.remove(invocation_id).map(|(_, channel)| channel)
    }

    /// The channel reaching the caller of a registered invocation.
    pub fn reply_channel(&self, invocation_id: &InvocationId) -> Option<SharedChannel<InvocationMessage>> {
        self.entries.get(invocation_id).map(|entry| entry.value().clone())
    }

    /// Returns `true` if the invocation is registered.
    pub fn contains(&self, invocation_id: &InvocationId) -> bool {
        self.entries.contains_key(invocation_id)
    }

    /// Number of registered invocations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no invocation is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for PendingInvocations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingInvocations")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Receives invocation protocol messages on the server side.
///
/// Invokes are registered, acknowledged and dispatched to the service registry. Cancels stop the
/// execution and forget the invocation. Responses are routed to the execution that asked for them.
#[derive(Clone)]
pub struct InvocationServerMessageReceiver {
    services: Arc<InvocationServerServiceRegistry>,
}

impl InvocationServerMessageReceiver {
    /// Creates a receiver dispatching to `services`.
    pub fn new(services: Arc<InvocationServerServiceRegistry>) -> Self {
        InvocationServerMessageReceiver { services }
    }

    /// The service registry invocations are dispatched to.
    pub fn services(&self) -> &Arc<InvocationServerServiceRegistry> {
        &self.services
    }
}

impl fmt::Debug for InvocationServerMessageReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationServerMessageReceiver")
            .field("services", &self.services)
            .finish()
    }
}

impl MessageReceiver<InvocationMessage> for InvocationServerMessageReceiver {
    fn on_message(&self, message: InvocationMessage, reply_channel: SharedChannel<InvocationMessage>) {
        let invocation_id = message.invocation_id();
        trace!(%invocation_id, kind = message.kind(), "server received message");

        match message {
            InvocationMessage::Invoke(invoke) => {
                let pending = self.services.pending();
                if !pending.register(invocation_id, reply_channel.clone()) {
                    warn!(%invocation_id, method = %invoke.method_name, "ignoring duplicate invocation");
                    return;
                }

                let services = self.services.clone();
                reply_channel.send(
                    AcknowledgeMessage { invocation_id }.into(),
                    Some(Box::new(move |err| {
                        warn!(%invocation_id, error = %err, "failed to acknowledge invocation");
                        if services.pending().unregister(&invocation_id).is_some() {
                            services.on_cancel(&invocation_id);
                        }
                    })),
                );

                // The acknowledgement may have failed synchronously.
                if pending.contains(&invocation_id) {
                    self.services.on_method_invocation(invoke);
                }
            }
            InvocationMessage::Cancel(_) => {
                self.services.on_cancel(&invocation_id);
                if self.services.pending().unregister(&invocation_id).is_some() {
                    debug!(%invocation_id, "invocation canceled by client");
                }
            }
            InvocationMessage::Response(response) => self.services.on_response(response),
            other => warn!(%invocation_id, kind = other.kind(), "server ignoring unexpected message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        channel::{ExceptionCallback, MessageChannel, NoReplyChannel},
        error::RemoteError,
        invocation::service_fn,
        message::{CancelMessage, MethodInvocationMessage},
    };

    struct RecordingChannel(mpsc::UnboundedSender<InvocationMessage>);

    impl MessageChannel<InvocationMessage> for RecordingChannel {
        fn send(&self, message: InvocationMessage, _on_error: Option<ExceptionCallback>) {
            let _ = self.0.send(message);
        }
    }

    fn recording() -> (SharedChannel<InvocationMessage>, mpsc::UnboundedReceiver<InvocationMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingChannel(tx)), rx)
    }

    fn invoke(invocation_id: InvocationId, method: &str) -> InvocationMessage {
        MethodInvocationMessage {
            invocation_id,
            method_name: method.to_string(),
            parameter: json!("ping"),
            client_id: None,
        }
        .into()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<InvocationMessage>) -> Option<InvocationMessage> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let pending = PendingInvocations::new();
        let invocation_id = InvocationId::new();

        assert!(pending.register(invocation_id, Arc::new(NoReplyChannel)));
        assert!(!pending.register(invocation_id, Arc::new(NoReplyChannel)));
        assert_eq!(pending.len(), 1);
        assert!(pending.unregister(&invocation_id).is_some());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn finished_invocation_is_unregistered() {
        let services = Arc::new(InvocationServerServiceRegistry::new());
        services.register_method(
            "echo",
            service_fn(|_ctx, parameter| async move { Ok::<_, RemoteError>(parameter) }),
        );
        let receiver = InvocationServerMessageReceiver::new(services.clone());
        let (channel, mut rx) = recording();
        let invocation_id = InvocationId::new();

        receiver.on_message(invoke(invocation_id, "echo"), channel);

        assert!(matches!(next(&mut rx).await, Some(InvocationMessage::Acknowledge(_))));
        match next(&mut rx).await {
            Some(InvocationMessage::Finished(msg)) => {
                assert_eq!(msg.invocation_id, invocation_id);
                assert_eq!(msg.result, json!("ping"));
            }
            other => panic!("expected finished, got {other:?}"),
        }
        assert!(services.pending().is_empty());
    }

    #[tokio::test]
    async fn unknown_method_answers_with_exception() {
        let services = Arc::new(InvocationServerServiceRegistry::new());
        let receiver = InvocationServerMessageReceiver::new(services.clone());
        let (channel, mut rx) = recording();

        receiver.on_message(invoke(InvocationId::new(), "missing"), channel);

        assert!(matches!(next(&mut rx).await, Some(InvocationMessage::Acknowledge(_))));
        match next(&mut rx).await {
            Some(InvocationMessage::Exception(msg)) => {
                assert_eq!(msg.error, RemoteError::unknown_method("missing"));
            }
            other => panic!("expected exception, got {other:?}"),
        }
        assert!(services.pending().is_empty());
    }

    #[tokio::test]
    async fn ack_failure_unregisters_without_executing() {
        let executed = Arc::new(AtomicBool::new(false));
        let services = Arc::new(InvocationServerServiceRegistry::new());
        let flag = executed.clone();
        services.register_method(
            "echo",
            service_fn(move |_ctx, parameter| {
                flag.store(true, Ordering::SeqCst);
                async move { Ok::<_, RemoteError>(parameter) }
            }),
        );
        let receiver = InvocationServerMessageReceiver::new(services.clone());

        receiver.on_message(invoke(InvocationId::new(), "echo"), Arc::new(NoReplyChannel));
        tokio::task::yield_now().await;

        assert!(services.pending().is_empty());
        assert_eq!(services.running_count(), 0);
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_stops_execution_and_suppresses_result() {
        let services = Arc::new(InvocationServerServiceRegistry::new());
        let (canceled_tx, mut canceled_rx) = mpsc::unbounded_channel();
        services.register_method(
            "wait",
            service_fn(move |ctx, _parameter| {
                let canceled_tx = canceled_tx.clone();
                async move {
                    ctx.canceled().await;
                    let _ = canceled_tx.send(ctx.is_canceled());
                    Ok::<_, RemoteError>(Value::Null)
                }
            }),
        );
        let receiver = InvocationServerMessageReceiver::new(services.clone());
        let (channel, mut rx) = recording();
        let invocation_id = InvocationId::new();

        receiver.on_message(invoke(invocation_id, "wait"), channel.clone());
        assert!(matches!(next(&mut rx).await, Some(InvocationMessage::Acknowledge(_))));
        assert!(services.pending().contains(&invocation_id));

        receiver.on_message(CancelMessage { invocation_id }.into(), channel);
        assert!(!services.pending().contains(&invocation_id));

        let canceled = tokio::time::timeout(Duration::from_secs(5), canceled_rx.recv()).await;
        assert!(matches!(canceled, Ok(Some(true))));
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    /// Holds on to delivery callbacks so a test can fail deliveries after the fact.
    #[derive(Default)]
    struct DeferredChannel {
        callbacks: std::sync::Mutex<Vec<ExceptionCallback>>,
        sent: std::sync::Mutex<Vec<InvocationMessage>>,
    }

    impl DeferredChannel {
        fn fail_all(&self) {
            let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
            for callback in callbacks {
                callback(crate::error::ChannelError::ConnectionClosed);
            }
        }
    }

    impl MessageChannel<InvocationMessage> for DeferredChannel {
        fn send(&self, message: InvocationMessage, on_error: Option<ExceptionCallback>) {
            self.sent.lock().unwrap().push(message);
            if let Some(on_error) = on_error {
                self.callbacks.lock().unwrap().push(on_error);
            }
        }
    }

    #[tokio::test]
    async fn late_ack_failure_cancels_running_execution() {
        let services = Arc::new(InvocationServerServiceRegistry::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (canceled_tx, mut canceled_rx) = mpsc::unbounded_channel();
        services.register_method(
            "wait",
            service_fn(move |ctx, _parameter| {
                let started_tx = started_tx.clone();
                let canceled_tx = canceled_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    ctx.canceled().await;
                    let _ = canceled_tx.send(ctx.is_canceled());
                    Ok::<_, RemoteError>(Value::Null)
                }
            }),
        );
        let receiver = InvocationServerMessageReceiver::new(services.clone());
        let channel = Arc::new(DeferredChannel::default());
        let invocation_id = InvocationId::new();

        receiver.on_message(invoke(invocation_id, "wait"), channel.clone());
        let started = tokio::time::timeout(Duration::from_secs(5), started_rx.recv()).await;
        assert!(matches!(started, Ok(Some(()))));
        assert!(services.pending().contains(&invocation_id));

        channel.fail_all();
        assert!(!services.pending().contains(&invocation_id));

        let canceled = tokio::time::timeout(Duration::from_secs(5), canceled_rx.recv()).await;
        assert!(matches!(canceled, Ok(Some(true))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], InvocationMessage::Acknowledge(_)));
    }
}
