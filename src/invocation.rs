//! Remote method invocations correlated by [`InvocationId`](crate::message::InvocationId).
//!
//! # Protocol
//!
//! ```text
//! client                                   server
//!   | -- Invoke(id, method, parameter) ------> |  register id -> reply channel
//!   | <-------------------- Acknowledge(id) -- |  (ack failure: unregister + cancel)
//!   | <----------------- Progress(id, ...) --- |
//!   | <------- Request(id, request_id, q) ---- |
//!   | -- Response(id, request_id, answer) ---> |
//!   | <------- Finished(id) | Exception(id) -- |  unregister
//!   | -- Cancel(id) -------------------------> |  cancel execution + unregister
//! ```
//!
//! Nothing is retried. A message lost by the channel is reported to the sender's exception callback
//! and the affected call fails on the side that noticed.
//!
//! # Wiring
//!
//! The client hands an [`InvocationClientServiceRegistry`] to its transport as the receiver, and
//! builds an [`InvocationClientService`] on the channel the transport returns. The server registers
//! its methods with an [`InvocationServerServiceRegistry`] and hands an
//! [`InvocationServerMessageReceiver`] wrapping it to its transport.

mod client;
mod client_registry;
mod interceptor;
mod server;
mod server_registry;

pub use client::*;
pub use client_registry::*;
pub use interceptor::*;
pub use server::*;
pub use server_registry::*;
