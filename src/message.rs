//! The messages exchanged between invocation clients and servers.
//!
//! Every message carries the [`InvocationId`] of the call it belongs to. A client starts a call with
//! [`MethodInvocationMessage`]; the server answers with an [`AcknowledgeMessage`], optionally
//! [`ProgressMessage`]s and [`RequestMessage`]s, and finally a [`FinishedMessage`] or an
//! [`ExceptionMessage`]. Requests are answered with [`ResponseMessage`]s and either side may send a
//! [`CancelMessage`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RemoteError;

/// Correlates a client-issued call with everything the server sends back for it.
///
/// Uses UUID v7, which is time-ordered and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(Uuid);

impl InvocationId {
    /// Generates a new invocation id.
    pub fn new() -> Self {
        InvocationId(Uuid::now_v7())
    }

    /// Wraps an existing uuid.
    pub fn from_uuid(uuid: Uuid) -> Self {
        InvocationId(uuid)
    }

    /// Returns the underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlates a request raised during an invocation with the caller's response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a new request id.
    pub fn new() -> Self {
        RequestId(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Starts a remote method call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodInvocationMessage {
    /// The id of the new invocation.
    pub invocation_id: InvocationId,
    /// The name the target service is registered under.
    pub method_name: String,
    /// The method parameter.
    pub parameter: Value,
    /// Identifies the calling client, if it chose to.
    pub client_id: Option<String>,
}

/// Abandons an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMessage {
    /// The invocation being abandoned.
    pub invocation_id: InvocationId,
}

/// Answers a [`RequestMessage`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// The invocation the request was raised in.
    pub invocation_id: InvocationId,
    /// The request being answered.
    pub request_id: RequestId,
    /// The answer.
    pub payload: Value,
}

/// Confirms that the server registered an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeMessage {
    /// The acknowledged invocation.
    pub invocation_id: InvocationId,
}

/// Completes an invocation successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinishedMessage {
    /// The completed invocation.
    pub invocation_id: InvocationId,
    /// The method's result.
    pub result: Value,
}

/// Completes an invocation with an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionMessage {
    /// The failed invocation.
    pub invocation_id: InvocationId,
    /// What went wrong.
    pub error: RemoteError,
}

/// Progress of a running invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Total number of steps, if known.
    pub total_steps: Option<u32>,
    /// Steps worked so far.
    pub worked: u32,
    /// What the service is currently doing.
    pub description: Option<String>,
}

/// Reports progress of a running invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMessage {
    /// The running invocation.
    pub invocation_id: InvocationId,
    /// The current progress.
    pub progress: Progress,
}

/// Asks the caller a question while an invocation is running.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// The running invocation.
    pub invocation_id: InvocationId,
    /// Correlates the caller's [`ResponseMessage`].
    pub request_id: RequestId,
    /// The question.
    pub question: Value,
}

/// Any message of the invocation protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InvocationMessage {
    /// Client to server: start a call.
    Invoke(MethodInvocationMessage),
    /// Either direction: abandon a call.
    Cancel(CancelMessage),
    /// Client to server: answer a request.
    Response(ResponseMessage),
    /// Server to client: the call was registered.
    Acknowledge(AcknowledgeMessage),
    /// Server to client: the call succeeded.
    Finished(FinishedMessage),
    /// Server to client: the call failed.
    Exception(ExceptionMessage),
    /// Server to client: progress report.
    Progress(ProgressMessage),
    /// Server to client: the running call needs an answer.
    Request(RequestMessage),
}

impl InvocationMessage {
    /// The invocation this message belongs to.
    pub fn invocation_id(&self) -> InvocationId {
        match self {
            InvocationMessage::Invoke(msg) => msg.invocation_id,
            InvocationMessage::Cancel(msg) => msg.invocation_id,
            InvocationMessage::Response(msg) => msg.invocation_id,
            InvocationMessage::Acknowledge(msg) => msg.invocation_id,
            InvocationMessage::Finished(msg) => msg.invocation_id,
            InvocationMessage::Exception(msg) => msg.invocation_id,
            InvocationMessage::Progress(msg) => msg.invocation_id,
            InvocationMessage::Request(msg) => msg.invocation_id,
        }
    }

    /// A short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationMessage::Invoke(_) => "invoke",
            InvocationMessage::Cancel(_) => "cancel",
            InvocationMessage::Response(_) => "response",
            InvocationMessage::Acknowledge(_) => "acknowledge",
            InvocationMessage::Finished(_) => "finished",
            InvocationMessage::Exception(_) => "exception",
            InvocationMessage::Progress(_) => "progress",
            InvocationMessage::Request(_) => "request",
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for InvocationMessage {
                fn from(msg: $ty) -> Self {
                    InvocationMessage::$variant(msg)
                }
            }
        )*
    };
}

impl_from_message!(
    Invoke(MethodInvocationMessage),
    Cancel(CancelMessage),
    Response(ResponseMessage),
    Acknowledge(AcknowledgeMessage),
    Finished(FinishedMessage),
    Exception(ExceptionMessage),
    Progress(ProgressMessage),
    Request(RequestMessage),
);

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec;

    #[test]
    fn invocation_ids_are_unique() {
        let a = InvocationId::new();
        let b = InvocationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn messages_survive_the_wire() -> Result<(), codec::CodecError> {
        let invocation_id = InvocationId::new();
        let msg: InvocationMessage = MethodInvocationMessage {
            invocation_id,
            method_name: "echo".to_string(),
            parameter: json!({ "text": "hello", "count": 3 }),
            client_id: Some("client-1".to_string()),
        }
        .into();

        let decoded: InvocationMessage = codec::decode(&codec::encode(&msg)?)?;
        assert_eq!(decoded, msg);
        assert_eq!(decoded.invocation_id(), invocation_id);
        assert_eq!(decoded.kind(), "invoke");
        Ok(())
    }
}
