//! The minimal contract every transport implements.
//!
//! A [`MessageChannel`] delivers a message best-effort and at most once; it never blocks and never
//! returns an error. Delivery failures are reported to the [`ExceptionCallback`] passed along with the
//! message, possibly before `send` returns and possibly later from another task.
//!
//! Inbound messages are handed to a [`MessageReceiver`] together with the channel that reaches
//! whoever sent them. Messages a transport accepted but never wrote, because its connection ended
//! first, are failed through their callbacks as well.

use std::{fmt, marker::PhantomData, sync::Arc};

use tracing::warn;

use crate::error::ChannelError;

/// Invoked at most once when a message could not be delivered.
pub type ExceptionCallback = Box<dyn FnOnce(ChannelError) + Send + 'static>;

/// A shared, type-erased message channel.
pub type SharedChannel<M> = Arc<dyn MessageChannel<M>>;

/// A shared, type-erased message receiver.
pub type SharedReceiver<M> = Arc<dyn MessageReceiver<M>>;

/// Sends messages to a single peer.
pub trait MessageChannel<M>: Send + Sync + 'static {
    /// Sends a message without waiting for it to be delivered.
    ///
    /// If delivery fails and `on_error` is set, it is called with the cause.
    fn send(&self, message: M, on_error: Option<ExceptionCallback>);
}

/// Handles messages arriving at a broker.
pub trait MessageReceiver<M>: Send + Sync + 'static {
    /// Handles a message. `reply_channel` reaches the peer the message came from.
    ///
    /// Called on transport tasks; implementations must not block.
    fn on_message(&self, message: M, reply_channel: SharedChannel<M>);

    /// Called when a client transport delivering to this receiver lost its peer.
    ///
    /// No further messages arrive from that peer, and replies still owed by it never will.
    fn on_disconnect(&self) {}
}

/// Reports a failed delivery to `on_error`, or logs it when no callback was given.
pub fn report_failure(on_error: Option<ExceptionCallback>, err: ChannelError) {
    match on_error {
        Some(on_error) => on_error(err),
        None => warn!(error = %err, "message dropped"),
    }
}

/// Creates a [`MessageReceiver`] from a closure.
pub fn receiver_fn<M, F>(f: F) -> FnReceiver<M, F>
where
    F: Fn(M, SharedChannel<M>) + Send + Sync + 'static,
{
    FnReceiver {
        f,
        phantom: PhantomData,
    }
}

/// A [`MessageReceiver`] backed by a closure, created with [`receiver_fn`].
pub struct FnReceiver<M, F> {
    f: F,
    phantom: PhantomData<fn(M)>,
}

impl<M, F> MessageReceiver<M> for FnReceiver<M, F>
where
    M: 'static,
    F: Fn(M, SharedChannel<M>) + Send + Sync + 'static,
{
    fn on_message(&self, message: M, reply_channel: SharedChannel<M>) {
        (self.f)(message, reply_channel)
    }
}

impl<M, F> fmt::Debug for FnReceiver<M, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnReceiver").finish_non_exhaustive()
    }
}

/// A channel for messages that arrived without a reply address.
///
/// Every send fails with [`ChannelError::NoReplyAddress`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReplyChannel;

impl<M: 'static> MessageChannel<M> for NoReplyChannel {
    fn send(&self, _message: M, on_error: Option<ExceptionCallback>) {
        report_failure(on_error, ChannelError::NoReplyAddress);
    }
}
