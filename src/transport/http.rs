//! HTTP long-poll transport.
//!
//! Clients identify themselves with a session id of their choosing. Messages travel as
//! length-delimited MessagePack bodies:
//!
//! - `POST /{broker}/messages/{session}` delivers client messages to the server's receiver.
//! - `GET /{broker}/poll/{session}` waits up to the poll timeout for messages queued for the session
//!   and returns them, or an empty body.
//! - `DELETE /{broker}/sessions/{session}` drops the session and any messages still queued for it.

mod client;
mod server;

pub use client::*;
pub use server::*;

/// Content type of every request and response body.
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

fn messages_path(broker: &str, session: &str) -> String {
    format!("/{broker}/messages/{session}")
}

fn poll_path(broker: &str, session: &str) -> String {
    format!("/{broker}/poll/{session}")
}

fn session_path(broker: &str, session: &str) -> String {
    format!("/{broker}/sessions/{session}")
}
