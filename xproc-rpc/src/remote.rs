use std::{os::unix::net::UnixStream, path::Path};

use bson::Bson;
use log::{debug, info};

use crate::{
    host::RpcHost,
    message::{Params, PeerId},
};

/// Peer id of the listener side as seen by a connecting host
pub const LISTENER_PEER_ID: PeerId = 0;

/// Connection to a listening host.
///
/// Manages the listener as peer `0`, learns the own peer id through the
/// `ready` handshake and announces served classes. Unmanages the peer when
/// closed or dropped. The host has to be running to complete the handshake.
pub struct RpcRemote {
    host: RpcHost,
    peer_id: PeerId,
    closed: bool,
}

impl RpcRemote {
    pub fn connect(host: &RpcHost, path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| crate::Error::Io(e.to_string()))?;

        debug!("Connected to {path:?}");
        Self::from_stream(host, stream)
    }

    /// Adopt an already connected stream, e.g. one end of a socket pair
    pub fn from_stream(host: &RpcHost, stream: UnixStream) -> crate::Result<Self> {
        host.manage(LISTENER_PEER_ID, stream)?;

        let mut remote = Self {
            host: host.clone(),
            peer_id: 0,
            closed: false,
        };

        remote.peer_id = remote.handshake()?;
        host.set_peer_id(remote.peer_id);
        host.announce(LISTENER_PEER_ID)?;

        info!(
            "Host `{}` joined as peer {}",
            host.name(),
            remote.peer_id
        );
        Ok(remote)
    }

    fn handshake(&self) -> crate::Result<PeerId> {
        let value = self.host.call(
            Params::Ready,
            LISTENER_PEER_ID,
            self.host.config().request_timeout,
        )?;

        let peer_id = match &value {
            Bson::Int64(peer_id) => PeerId::try_from(*peer_id).ok(),
            Bson::Int32(peer_id) => PeerId::try_from(*peer_id).ok(),
            _ => None,
        };

        peer_id.ok_or_else(|| {
            crate::Error::ProtocolError(format!("Invalid `ready` response: {value}"))
        })
    }

    /// Own peer id assigned by the listener
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn host(&self) -> &RpcHost {
        &self.host
    }

    /// Disconnect from the listener
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.host.unmanage(LISTENER_PEER_ID);
        }
    }
}

impl Drop for RpcRemote {
    fn drop(&mut self) {
        self.close()
    }
}
