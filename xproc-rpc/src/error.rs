use thiserror::Error;

use crate::message::PeerId;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No reachable peer serves the class, or the target peer doesn't know it
    #[error("Class `{0}` is not served by the target peer")]
    ClassNotFound(String),
    /// Owning peer has no such instance, or the instance has no such method
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    /// Remote method ran and failed. Contains remote diagnostic trace
    #[error("Remote method failed: {0}")]
    MethodFailed(String),
    /// Peer disconnected before the response arrived
    #[error("Peer disconnected")]
    PeerDisconnected,
    /// Peer is not managed by the host
    #[error("Peer {0} is not connected")]
    NoSuchPeer(PeerId),
    /// Peer id is taken by another connection
    #[error("Peer {0} is already managed")]
    PeerAlreadyManaged(PeerId),
    /// No response in time
    #[error("Timed out waiting for a response")]
    Timeout,
    /// Host has stopped
    #[error("RPC host is stopped")]
    HostStopped,
    /// Invalid call params. Contains serialization error
    #[error("Invalid call params: {0}")]
    ParamsTypeError(String),
    /// Invalid result type. Contains deserialization error
    #[error("Invalid result type: {0}")]
    ResultTypeError(String),
    /// Malformed frame or payload
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    /// Socket or file operation failed
    #[error("I/O error: {0}")]
    Io(String),
    /// Failed to launch a child process or a thread
    #[error("Failed to spawn: {0}")]
    SpawnFailed(String),
    /// Internal library error. Should never happen
    #[error("Internal xproc error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
