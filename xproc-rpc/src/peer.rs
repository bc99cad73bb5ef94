use std::{
    net::Shutdown,
    os::{fd::AsFd, fd::BorrowedFd, unix::net::UnixStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use log::trace;

use crate::{
    lock,
    message::PeerId,
    message_stream::{FrameReader, WriteFrame},
};

/// Connection to a managed peer
pub(crate) struct Peer {
    id: PeerId,
    /// Read only by the pool's active worker
    reader: UnixStream,
    /// Marker scan state kept across read timeouts
    frames: Mutex<FrameReader>,
    /// One frame at a time
    writer: Mutex<UnixStream>,
    alive: AtomicBool,
}

impl Peer {
    pub fn new(id: PeerId, stream: UnixStream, read_timeout: Duration) -> crate::Result<Self> {
        stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(read_timeout)))
            .map_err(|e| crate::Error::Io(e.to_string()))?;

        let writer = stream
            .try_clone()
            .map_err(|e| crate::Error::Io(e.to_string()))?;

        Ok(Self {
            id,
            reader: stream,
            frames: Mutex::new(FrameReader::new()),
            writer: Mutex::new(writer),
            alive: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    pub fn send(&self, payload: &[u8]) -> crate::Result<()> {
        if !self.is_alive() {
            return Err(crate::Error::PeerDisconnected);
        }

        trace!("Writing {} bytes to peer {}", payload.len(), self.id);
        lock(&self.writer).write_frame(payload)
    }

    /// Next frame payload, or `None` if the peer went quiet before a frame marker
    pub fn read_frame(&self) -> crate::Result<Option<Vec<u8>>> {
        let mut reader = &self.reader;
        lock(&self.frames).read_frame(&mut reader)
    }

    /// Shut the socket down. Wakes up anyone blocked on it
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let _ = self.reader.shutdown(Shutdown::Both);
        }
    }
}
