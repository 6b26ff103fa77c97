//! Defines error handling constructs for cap-remoting.
//!
//! Channel failures never surface as panics or return values of `send`; they are handed to the
//! exception callback supplied with the message. Everything above the channel layer uses the
//! `Result` based errors defined here.

use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::codec::CodecError;

/// An error reported by a message channel while delivering a message.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The receiving mailbox is full.
    #[error("mailbox full")]
    MailboxFull,
    /// The receiving side is no longer running.
    #[error("receiver not running")]
    NotRunning,
    /// The connection carrying the channel has been closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The message arrived without an address to reply to.
    #[error("no reply address")]
    NoReplyAddress,
    /// The message could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// An io error on the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// An HTTP request failed before a response was received.
    #[error("http error: {0}")]
    Http(String),
    /// The HTTP peer answered with an unexpected status code.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),
}

/// The category of an error raised while executing an invocation on the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// No service is registered for the invoked method.
    UnknownMethod,
    /// The parameter could not be interpreted by the service.
    InvalidParameter,
    /// An execution interceptor refused the invocation.
    Rejected,
    /// The invocation was canceled before it completed.
    Canceled,
    /// The service failed while executing.
    ServiceFailure,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::UnknownMethod => write!(f, "unknown method"),
            RemoteErrorKind::InvalidParameter => write!(f, "invalid parameter"),
            RemoteErrorKind::Rejected => write!(f, "rejected"),
            RemoteErrorKind::Canceled => write!(f, "canceled"),
            RemoteErrorKind::ServiceFailure => write!(f, "service failure"),
        }
    }
}

/// A serializable error produced by a remote service and shipped back to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// What went wrong.
    pub kind: RemoteErrorKind,
    /// A human readable description.
    pub message: String,
}

impl RemoteError {
    /// Creates a new remote error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        RemoteError {
            kind,
            message: message.into(),
        }
    }

    /// No service is registered under `method`.
    pub fn unknown_method(method: &str) -> Self {
        RemoteError::new(
            RemoteErrorKind::UnknownMethod,
            format!("no service registered for method '{method}'"),
        )
    }

    /// The parameter could not be interpreted.
    pub fn invalid_parameter(err: impl fmt::Display) -> Self {
        RemoteError::new(RemoteErrorKind::InvalidParameter, err.to_string())
    }

    /// The service failed.
    pub fn service_failure(err: impl fmt::Display) -> Self {
        RemoteError::new(RemoteErrorKind::ServiceFailure, err.to_string())
    }

    /// The invocation was canceled.
    pub fn canceled() -> Self {
        RemoteError::new(RemoteErrorKind::Canceled, "invocation canceled")
    }
}

/// An error returned to the caller of a remote invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The invocation was canceled, locally or by the server.
    #[error("invocation canceled")]
    Canceled,
    /// The remote service reported an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The message channel failed to deliver a message belonging to this invocation.
    #[error("channel failure: {0}")]
    Channel(#[from] ChannelError),
    /// The pending call was dropped without ever receiving an answer.
    #[error("invocation abandoned")]
    Abandoned,
    /// The result or parameter could not be converted.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// An error that can occur when resolving configuration.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An execution interceptor name did not match any known interceptor.
    #[error("unknown execution interceptor '{0}'")]
    UnknownInterceptor(String),
    /// The broker id was empty.
    #[error("broker id must not be empty")]
    EmptyBrokerId,
}

/// An error raised by the in-memory CRUD repository and bean provider.
#[derive(Debug, Error)]
pub enum CrudError {
    /// No bean is stored under the id.
    #[error("bean {0} not found")]
    NotFound(String),
    /// A bean is already stored under the id.
    #[error("bean {0} already exists")]
    AlreadyExists(String),
    /// The stored bean is newer than the one being written.
    #[error("bean {id} was modified concurrently (stored version {stored}, given {given})")]
    StaleVersion {
        /// The bean's id.
        id: String,
        /// Version currently stored.
        stored: u64,
        /// Version of the rejected write.
        given: u64,
    },
    /// A bean could not be converted to or from its DTO.
    #[error("bean conversion failed: {0}")]
    Conversion(#[from] serde_json::Error),
}
