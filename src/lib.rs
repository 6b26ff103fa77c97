//! Request, response and cancel semantics layered over fire-and-forget message channels.
//!
//! A [`MessageChannel`](channel::MessageChannel) only promises best-effort, at-most-once delivery of
//! an opaque message. The [`invocation`] module builds remote method calls on top of that: a client
//! tags every call with an [`InvocationId`](message::InvocationId), the server acknowledges it,
//! reports progress, may ask the caller questions, and finally answers with a result or an error.
//! Either side can cancel.
//!
//! Three transports ship messages between brokers:
//!
//! - [`transport::actor`]: an in-process mailbox actor.
//! - [`transport::socket`]: length-delimited MessagePack frames over TCP.
//! - `transport::http`: HTTP long-polling (behind the `http` feature).
//!
//! The [`bean`] module provides the CRUD vocabulary usually shipped over invocations:
//! property-map DTOs, sorting, an in-memory repository and a remote CRUD adapter.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod bean;
pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod invocation;
pub mod message;
pub mod transport;

pub use broker::{BrokerId, Messaging};
pub use channel::{MessageChannel, MessageReceiver, SharedChannel};
pub use message::{InvocationId, InvocationMessage, RequestId};
