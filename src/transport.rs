//! Transports carrying messages between brokers.
//!
//! Each transport hands inbound messages to a [`MessageReceiver`](crate::channel::MessageReceiver)
//! and exposes outbound [`MessageChannel`](crate::channel::MessageChannel)s. None of them add
//! delivery guarantees beyond first-in first-out per connection or mailbox.

pub mod actor;
#[cfg(feature = "http")]
pub mod http;
pub mod socket;
