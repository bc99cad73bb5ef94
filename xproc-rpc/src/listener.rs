use std::{
    fs,
    io::ErrorKind,
    os::{fd::AsFd, unix::net::UnixListener},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};

use crate::{host::RpcHost, message::PeerId};

/// Accepts peer connections on a Unix socket path and hands them to the host.
///
/// Accepted peers get ids from 1 upward and receive the list of classes the
/// host serves right away. Stopping the listener keeps managed peers alive.
pub struct RpcListener {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RpcListener {
    /// Bind to `path`, replacing a stale socket file, and start accepting
    pub fn bind(host: &RpcHost, path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            debug!("Removing stale socket file at {path:?}");
            fs::remove_file(&path).map_err(|e| crate::Error::Io(e.to_string()))?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| crate::Error::Io(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| crate::Error::Io(e.to_string()))?;

        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let host = host.clone();
            let stop = stop.clone();

            thread::Builder::new()
                .name(format!("{}-listener", host.name()))
                .spawn(move || accept_loop(host, listener, stop))
                .map_err(|e| crate::Error::SpawnFailed(e.to_string()))?
        };

        info!("Host `{}` listens at {path:?}", host.name());

        Ok(Self {
            path,
            stop,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);

        let Some(thread) = self.thread.take() else {
            return;
        };

        if thread.join().is_err() {
            error!("Listener thread at {:?} panicked", self.path);
        }

        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove socket file at {:?}: {e}", self.path);
        }
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        self.stop()
    }
}

fn accept_loop(host: RpcHost, listener: UnixListener, stop: Arc<AtomicBool>) {
    let poll_interval = host.config().poll_interval;
    let timeout = PollTimeout::from(u16::try_from(poll_interval.as_millis()).unwrap_or(u16::MAX));
    let mut next_peer_id: PeerId = 1;

    while !stop.load(Ordering::Acquire) && !host.is_stopped() {
        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to poll listener socket: {e}");
                thread::sleep(poll_interval);
                continue;
            }
        }

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => {
                warn!("Failed to accept a connection: {e}");
                continue;
            }
        };

        let peer_id = next_peer_id;
        next_peer_id += 1;

        debug!("New connection. Peer id {peer_id}");

        if let Err(e) = host.manage(peer_id, stream) {
            warn!("Failed to manage peer {peer_id}: {e}");
            continue;
        }

        if let Err(e) = host.announce(peer_id) {
            warn!("Failed to announce classes to peer {peer_id}: {e}");
        }
    }

    debug!("Listener of host `{}` exited", host.name());
}
