use std::collections::HashMap;

use log::{debug, info, trace, warn};

use crate::{
    lock,
    message::{PeerId, RequestId, RequestState},
    request::{Request, SharedRequest, STAMP_CALLER_RECEIVED},
};

struct PendingCall {
    peer_id: PeerId,
    request: SharedRequest,
}

/// A registry of calls, which are added when sent, and resolved after
/// the peer has responded
#[derive(Default)]
pub(crate) struct CallsRegistry {
    calls: HashMap<RequestId, PendingCall>,
}

impl CallsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_call(&mut self, request_id: RequestId, peer_id: PeerId, request: SharedRequest) {
        trace!("Add new call {request_id} to peer {peer_id}");

        self.calls.insert(request_id, PendingCall { peer_id, request });
    }

    /// Deliver a response. Returns `true` if a waiting request was resolved.
    /// Responses for unknown or already terminal requests are dropped
    pub fn resolve(&mut self, request_id: RequestId, response: Request) -> bool {
        let Some(call) = self.calls.remove(&request_id) else {
            warn!("Unexpected peer response. Call registry doesn't have request {request_id}");
            return false;
        };

        let mut request = lock(&call.request);

        if request.is_terminal() {
            debug!("Dropping response for already completed request {request_id}");
            return false;
        }

        request.result = response.result;
        request.diagnostic.extend(response.diagnostic);
        request.stamp(STAMP_CALLER_RECEIVED);
        request.state = RequestState::ResponseRcvd;

        debug!("Succesfully resolved {request_id} call");
        true
    }

    /// Forget a request without resolving it
    pub fn remove(&mut self, request_id: RequestId) -> Option<SharedRequest> {
        self.calls.remove(&request_id).map(|call| call.request)
    }

    /// Fail every request addressed to the peer. Returns number of failed requests
    pub fn fail_peer(&mut self, peer_id: PeerId) -> usize {
        let failed: Vec<RequestId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();

        for request_id in &failed {
            if let Some(call) = self.calls.remove(request_id) {
                fail(&call.request);
            }
        }

        if !failed.is_empty() {
            info!("Failed {} pending calls to peer {peer_id}", failed.len());
        }

        failed.len()
    }

    /// Fail every pending request
    pub fn clear_pending_calls(&mut self) {
        info!("Clearing calls queue");

        for (_, call) in self.calls.drain() {
            fail(&call.request);
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

fn fail(request: &SharedRequest) {
    let mut request = lock(request);

    if !request.is_terminal() {
        request.state = RequestState::RpcError;
    }
}
