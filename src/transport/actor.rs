//! In-process transport where each broker is a mailbox actor.
//!
//! An [`ActorBroker`] runs in its own tokio task, processing messages from a bounded mailbox one at a
//! time and handing them to its receiver. Sends never wait: a full mailbox is reported as
//! [`ChannelError::MailboxFull`] through the exception callback.
//!
//! ```
//! use std::sync::Arc;
//!
//! use cap_remoting::channel::{receiver_fn, SharedChannel};
//! use cap_remoting::transport::actor::ActorBroker;
//!
//! # tokio_test::block_on(async {
//! let server = ActorBroker::<String>::spawn(Arc::new(receiver_fn(
//!     |msg: String, reply: SharedChannel<String>| reply.send(format!("{msg}!"), None),
//! )));
//! let client = ActorBroker::<String>::spawn(Arc::new(receiver_fn(
//!     |msg: String, _reply: SharedChannel<String>| println!("{msg}"),
//! )));
//!
//! server.channel_from(&client).send("hello".to_string(), None);
//! # server.stop().await;
//! # client.stop().await;
//! # })
//! ```

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, error, trace};

use crate::{
    channel::{
        report_failure, ExceptionCallback, MessageChannel, NoReplyChannel, SharedChannel,
        SharedReceiver,
    },
    error::ChannelError,
};

const DEFAULT_MAILBOX_CAPACITY: usize = 64;

static BROKER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Locally unique id of an actor broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorBrokerId(u64);

impl ActorBrokerId {
    fn generate() -> Self {
        ActorBrokerId(BROKER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActorBrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-broker-{}", self.0)
    }
}

enum Signal<M> {
    Message {
        message: M,
        reply_to: Option<ActorAddress<M>>,
        on_error: Option<ExceptionCallback>,
    },
    Stop,
}

impl<M> Signal<M> {
    fn fail(self, err: ChannelError) {
        if let Signal::Message { on_error, .. } = self {
            report_failure(on_error, err);
        }
    }
}

/// The mailbox address of an actor broker.
pub struct ActorAddress<M> {
    id: ActorBrokerId,
    tx: mpsc::Sender<Signal<M>>,
}

impl<M> ActorAddress<M> {
    /// The id of the broker behind this address.
    pub fn id(&self) -> ActorBrokerId {
        self.id
    }

    /// Returns `true` once the broker stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<M> Clone for ActorAddress<M> {
    fn clone(&self) -> Self {
        ActorAddress {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<M> fmt::Debug for ActorAddress<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorAddress")
            .field("id", &self.id)
            .finish()
    }
}

/// A channel delivering into an actor broker's mailbox.
pub struct ActorChannel<M> {
    target: ActorAddress<M>,
    reply_to: Option<ActorAddress<M>>,
}

impl<M: Send + 'static> MessageChannel<M> for ActorChannel<M> {
    fn send(&self, message: M, on_error: Option<ExceptionCallback>) {
        let signal = Signal::Message {
            message,
            reply_to: self.reply_to.clone(),
            on_error,
        };
        match self.target.tx.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(signal)) => signal.fail(ChannelError::MailboxFull),
            Err(TrySendError::Closed(signal)) => signal.fail(ChannelError::NotRunning),
        }
    }
}

impl<M> fmt::Debug for ActorChannel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorChannel")
            .field("target", &self.target)
            .field("reply_to", &self.reply_to)
            .finish()
    }
}

/// A broker running as a mailbox actor.
pub struct ActorBroker<M> {
    address: ActorAddress<M>,
    handle: JoinHandle<()>,
}

impl<M: Send + 'static> ActorBroker<M> {
    /// Spawns a broker with the default mailbox capacity.
    pub fn spawn(receiver: SharedReceiver<M>) -> Self {
        Self::spawn_with_capacity(receiver, DEFAULT_MAILBOX_CAPACITY)
    }

    /// Spawns a broker whose mailbox holds at most `capacity` pending messages.
    pub fn spawn_with_capacity(receiver: SharedReceiver<M>, capacity: usize) -> Self {
        let id = ActorBrokerId::generate();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let weak_tx = tx.downgrade();
        let handle = tokio::spawn(run_broker(id, rx, weak_tx, receiver));
        trace!(%id, "actor broker started");

        ActorBroker {
            address: ActorAddress { id, tx },
            handle,
        }
    }

    /// The broker's id.
    pub fn id(&self) -> ActorBrokerId {
        self.address.id
    }

    /// The broker's mailbox address.
    pub fn address(&self) -> ActorAddress<M> {
        self.address.clone()
    }

    /// A channel into this broker whose messages carry no reply address.
    pub fn channel(&self) -> SharedChannel<M> {
        Arc::new(ActorChannel {
            target: self.address.clone(),
            reply_to: None,
        })
    }

    /// A channel into this broker whose replies are delivered to `sender`.
    pub fn channel_from(&self, sender: &ActorBroker<M>) -> SharedChannel<M> {
        Arc::new(ActorChannel {
            target: self.address.clone(),
            reply_to: Some(sender.address.clone()),
        })
    }

    /// Returns `true` while the broker processes messages.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the broker after the messages already in its mailbox have been processed.
    ///
    /// Messages arriving after the stop request are failed with [`ChannelError::NotRunning`].
    pub async fn stop(self) {
        if self.address.tx.send(Signal::Stop).await.is_ok() {
            let _ = self.handle.await;
        }
    }
}

impl<M> fmt::Debug for ActorBroker<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorBroker")
            .field("address", &self.address)
            .finish()
    }
}

async fn run_broker<M: Send + 'static>(
    id: ActorBrokerId,
    mut rx: mpsc::Receiver<Signal<M>>,
    weak_tx: mpsc::WeakSender<Signal<M>>,
    receiver: SharedReceiver<M>,
) {
    while let Some(signal) = rx.recv().await {
        let (message, reply_to) = match signal {
            Signal::Message {
                message, reply_to, ..
            } => (message, reply_to),
            Signal::Stop => break,
        };

        let reply_channel: SharedChannel<M> = match reply_to {
            Some(target) => Arc::new(ActorChannel {
                target,
                reply_to: weak_tx.upgrade().map(|tx| ActorAddress { id, tx }),
            }),
            None => Arc::new(NoReplyChannel),
        };

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            receiver.on_message(message, reply_channel)
        }));
        if res.is_err() {
            error!(%id, "receiver panicked while handling a message");
        }
    }

    rx.close();
    let mut unprocessed = 0usize;
    while let Ok(signal) = rx.try_recv() {
        unprocessed += 1;
        signal.fail(ChannelError::NotRunning);
    }
    debug!(%id, unprocessed, "actor broker stopped");
}
