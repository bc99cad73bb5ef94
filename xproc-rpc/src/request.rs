use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::message::{
    Diagnostic, Method, Origin, Params, RequestId, RequestState, RpcMessage, RpcResult,
};

/// Diagnostic stamp names
pub const STAMP_CALLER_SENT: &str = "caller_sent";
pub const STAMP_CALLEE_RECEIVED: &str = "callee_received";
pub const STAMP_CALLEE_DONE: &str = "callee_done";
pub const STAMP_CALLER_RECEIVED: &str = "caller_received";

/// Request handle shared between a waiting caller and the host
pub type SharedRequest = Arc<Mutex<Request>>;

/// One logical call or its reply
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Assigned by the host on [crate::host::RpcHost::put]. `None` suppresses a reply
    pub request_id: Option<RequestId>,
    pub params: Params,
    pub result: Option<RpcResult>,
    pub state: RequestState,
    pub diagnostic: Diagnostic,
    pub origin: Origin,
}

impl Request {
    pub fn new(params: Params) -> Self {
        Self {
            request_id: None,
            params,
            result: None,
            state: RequestState::Created,
            diagnostic: Diagnostic::new(),
            origin: Origin::Caller,
        }
    }

    /// New request wrapped into a [SharedRequest]
    pub fn shared(params: Params) -> SharedRequest {
        Arc::new(Mutex::new(Self::new(params)))
    }

    pub fn method(&self) -> Method {
        self.params.method()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record current time under `name`
    pub fn stamp(&mut self, name: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        self.diagnostic.insert(name.to_owned(), now);
    }

    /// Time between sending the request and receiving its response
    pub fn round_trip(&self) -> Option<Duration> {
        let sent = self.diagnostic.get(STAMP_CALLER_SENT)?;
        let received = self.diagnostic.get(STAMP_CALLER_RECEIVED)?;

        Duration::try_from_secs_f64(received - sent).ok()
    }

    pub fn to_message(&self) -> RpcMessage {
        RpcMessage {
            request_id: self.request_id,
            method: self.method(),
            params: self.params.clone(),
            result: self.result.clone(),
            state: self.state,
            diagnostic: self.diagnostic.clone(),
            origin: self.origin,
        }
    }

    pub fn from_message(message: RpcMessage) -> crate::Result<Self> {
        if message.method != message.params.method() {
            return Err(crate::Error::ProtocolError(format!(
                "Method `{}` doesn't match `{}` params",
                message.method,
                message.params.method()
            )));
        }

        Ok(Self {
            request_id: message.request_id,
            params: message.params,
            result: message.result,
            state: message.state,
            diagnostic: message.diagnostic,
            origin: message.origin,
        })
    }
}
