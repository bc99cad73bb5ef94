use std::{collections::BTreeMap, fmt};

use bson::{Bson, Document};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::class_registry::MethodError;

/// Peer identifier. `0` is the listener side as seen by connecting peers
pub type PeerId = u32;
/// Instance identifier, scoped to the host which constructed the instance
pub type RpcId = i64;
/// Request identifier, unique within a host
pub type RequestId = i64;
/// Named timestamps (seconds since UNIX epoch) collected along the request path
pub type Diagnostic = BTreeMap<String, f64>;

/// Request method
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Create,
    Delete,
    Call,
    Publish,
    Ready,
    ExitRequest,
    ExitNotify,
    NodeStatus,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Delete => "delete",
            Method::Call => "call",
            Method::Publish => "publish",
            Method::Ready => "ready",
            Method::ExitRequest => "exit_request",
            Method::ExitNotify => "exit_notify",
            Method::NodeStatus => "node_status",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method-specific request payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Params {
    /// Construct an instance of a served class
    Create { class: String, args: Args },
    /// Drop an instance
    Delete { rpcid: RpcId },
    /// Invoke an instance method
    Call {
        rpcid: RpcId,
        method: String,
        args: Args,
    },
    /// Full list of classes served by the sender
    Publish { classes: Vec<String> },
    /// Handshake. Response value is the peer id assigned to the sender
    Ready,
    /// Ask the receiver to shut down
    ExitRequest,
    /// Sender is leaving
    ExitNotify,
    /// Opaque status report
    NodeStatus(Bson),
}

impl Params {
    pub fn method(&self) -> Method {
        match self {
            Params::Create { .. } => Method::Create,
            Params::Delete { .. } => Method::Delete,
            Params::Call { .. } => Method::Call,
            Params::Publish { .. } => Method::Publish,
            Params::Ready => Method::Ready,
            Params::ExitRequest => Method::ExitRequest,
            Params::ExitNotify => Method::ExitNotify,
            Params::NodeStatus(_) => Method::NodeStatus,
        }
    }
}

/// Positional and keyword call arguments
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Bson>,
    pub keyword: Document,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn with<T: Serialize>(mut self, value: &T) -> crate::Result<Self> {
        let value =
            bson::to_bson(value).map_err(|e| crate::Error::ParamsTypeError(e.to_string()))?;

        self.positional.push(value);
        Ok(self)
    }

    /// Add a keyword argument
    pub fn with_kw<T: Serialize>(mut self, name: &str, value: &T) -> crate::Result<Self> {
        let value =
            bson::to_bson(value).map_err(|e| crate::Error::ParamsTypeError(e.to_string()))?;

        self.keyword.insert(name, value);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positional argument at `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, MethodError> {
        let value = self
            .positional
            .get(index)
            .ok_or_else(|| MethodError::Failed(format!("Missing argument #{index}")))?;

        bson::from_bson(value.clone())
            .map_err(|e| MethodError::Failed(format!("Invalid argument #{index}: {e}")))
    }

    /// Keyword argument `name`, if given
    pub fn kw<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, MethodError> {
        match self.keyword.get(name) {
            Some(value) => bson::from_bson(value.clone())
                .map(Some)
                .map_err(|e| MethodError::Failed(format!("Invalid argument `{name}`: {e}"))),
            None => Ok(None),
        }
    }
}

/// Response status code
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    ClassNotFound,
    MethodNotFound,
    MethodFailed,
    Error,
}

/// Completed call outcome
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcResult {
    pub status: Status,
    pub value: Bson,
}

impl RpcResult {
    pub fn ok(value: Bson) -> Self {
        Self {
            status: Status::Ok,
            value,
        }
    }

    /// Failure status with a text diagnostic
    pub fn failure(status: Status, text: impl Into<String>) -> Self {
        Self {
            status,
            value: Bson::String(text.into()),
        }
    }

    /// Convert into a library result. Non-`Ok` statuses become typed errors carrying the text
    pub fn into_result(self) -> crate::Result<Bson> {
        if self.status == Status::Ok {
            return Ok(self.value);
        }

        let text = match self.value {
            Bson::String(text) => text,
            other => other.to_string(),
        };

        Err(match self.status {
            Status::ClassNotFound => crate::Error::ClassNotFound(text),
            Status::MethodNotFound => crate::Error::MethodNotFound(text),
            Status::MethodFailed => crate::Error::MethodFailed(text),
            Status::Ok | Status::Error => crate::Error::InternalError(text),
        })
    }
}

/// Request lifecycle state
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    Submitted,
    /// Received by the callee, waiting for local execution
    ResponsePend,
    /// Executed by the callee, ready to be sent back
    ResponseDone,
    /// Response delivered to the caller
    ResponseRcvd,
    /// Transport failure or timeout
    RpcError,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::ResponseRcvd | RequestState::RpcError)
    }
}

/// Which side of the exchange the frame comes from
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Sent by the side which initiated the request
    Caller,
    /// Response sent back by the executing side
    Callee,
}

/// Wire record. One per frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub request_id: Option<RequestId>,
    pub method: Method,
    pub params: Params,
    pub result: Option<RpcResult>,
    pub state: RequestState,
    pub diagnostic: Diagnostic,
    pub origin: Origin,
}
