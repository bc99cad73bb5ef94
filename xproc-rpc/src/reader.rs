use std::{sync::Arc, thread, time::Duration};

use log::{trace, warn};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use xproc_worker_pool::{Capture, WorkError, Worker};

use crate::{host::RpcHost, message::PeerId, peer::Peer};

/// Raw frame payload read from a peer
pub struct IncomingFrame {
    pub peer_id: PeerId,
    pub data: Vec<u8>,
}

/// Host dispatch worker. Captures by polling every managed peer socket
/// and reading one frame from a readable one
pub struct PeerReader {
    host: RpcHost,
    /// Round-robin cursor, so a chatty peer can't starve the rest
    next: usize,
}

impl PeerReader {
    pub fn new(host: RpcHost) -> Self {
        Self { host, next: 0 }
    }

    fn poll_interval(&self) -> Duration {
        self.host.config().poll_interval
    }

    /// Index of a readable peer, starting from the cursor
    fn select_ready(&mut self, peers: &[Arc<Peer>]) -> Option<usize> {
        let events = PollFlags::POLLIN | PollFlags::POLLPRI;
        let mut fds: Vec<PollFd> = peers
            .iter()
            .map(|peer| PollFd::new(peer.fd(), events))
            .collect();

        let millis = self.poll_interval().as_millis();
        let timeout = PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX));

        match poll(&mut fds, timeout) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(Errno::EINTR) => return None,
            Err(e) => {
                warn!("Failed to poll peer sockets: {e}");
                thread::sleep(self.poll_interval());
                return None;
            }
        }

        let ready = PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLHUP | PollFlags::POLLERR;
        let count = fds.len();

        let index = (0..count)
            .map(|offset| (self.next + offset) % count)
            .find(|index| {
                fds[*index]
                    .revents()
                    .map(|revents| revents.intersects(ready))
                    .unwrap_or(false)
            })?;

        self.next = (index + 1) % count;
        Some(index)
    }
}

impl Worker for PeerReader {
    type Work = IncomingFrame;

    fn take_work(&mut self) -> Capture<IncomingFrame> {
        let peers: Vec<Arc<Peer>> = self
            .host
            .peers_snapshot()
            .into_iter()
            .filter(|peer| peer.is_alive())
            .collect();

        if peers.is_empty() {
            thread::sleep(self.poll_interval());
            return Capture::Empty;
        }

        let Some(index) = self.select_ready(&peers) else {
            return Capture::Empty;
        };

        let peer = &peers[index];

        match peer.read_frame() {
            Ok(Some(data)) => {
                trace!("Read {} bytes from peer {}", data.len(), peer.id());

                Capture::Work(IncomingFrame {
                    peer_id: peer.id(),
                    data,
                })
            }
            Ok(None) => Capture::Empty,
            Err(e) => {
                trace!("Failed to read from peer {}: {e}", peer.id());
                self.host.peer_died(peer.id());

                Capture::Empty
            }
        }
    }

    fn perform_work(&mut self, frame: IncomingFrame) -> Result<(), WorkError> {
        self.host.dispatch_rpcdata(&frame.data, frame.peer_id);
        Ok(())
    }
}
