//! # xproc RPC
//!
//! Remote object RPC between cooperating processes over Unix domain sockets.
//!
//! Every process runs an [RpcHost]. A host publishes classes it can construct,
//! learns which classes its peers serve, and creates and calls instances
//! through [RpcObject] proxies. A proxy to a local instance calls it in-process,
//! a proxy to a remote one sends `call` requests and blocks for the reply.
//!
//! Connections are made with [RpcListener] (server side, peers get ids from 1)
//! and [RpcRemote] (client side, the listener is peer `0`). [ExecRemote] and
//! [MultiRemote] launch the processes which connect back.
//!
//! # Examples
//! ```rust,no_run
//! use bson::Bson;
//! use xproc_rpc::{
//!     reply, Args, HostConfig, MethodError, RpcClass, RpcHost, RpcListener, RpcObject, RpcRemote,
//! };
//!
//! struct Echo;
//!
//! impl RpcClass for Echo {
//!     const CLASS_NAME: &'static str = "Echo";
//!
//!     fn construct(_args: Args) -> Result<Self, String> {
//!         Ok(Echo)
//!     }
//!
//!     fn dispatch(&self, method: &str, args: Args) -> Result<Bson, MethodError> {
//!         match method {
//!             "reflect" => reply(&args.get::<i64>(0)?),
//!             _ => Err(MethodError::NotFound),
//!         }
//!     }
//! }
//!
//! fn server() -> xproc_rpc::Result<()> {
//!     let host = RpcHost::new(HostConfig::new("server").master(true));
//!     host.publish::<Echo>();
//!     host.start()?;
//!
//!     let _listener = RpcListener::bind(&host, "/tmp/echo.sock")?;
//!     host.wait_for_exit(None);
//!     host.finish();
//!     Ok(())
//! }
//!
//! fn client() -> xproc_rpc::Result<()> {
//!     let host = RpcHost::new(HostConfig::new("client"));
//!     host.start()?;
//!
//!     let _remote = RpcRemote::connect(&host, "/tmp/echo.sock")?;
//!     host.subscribe::<Echo>(None)?;
//!
//!     let echo = RpcObject::<Echo>::create(&host, Args::new())?;
//!     let value: i64 = echo.call("reflect", Args::new().with(&42)?)?;
//!     assert_eq!(value, 42);
//!
//!     host.finish();
//!     Ok(())
//! }
//! ```
use std::sync::{Mutex, MutexGuard, PoisonError};

mod calls_registry;
pub mod class_registry;
pub mod config;
mod error;
pub mod exec_remote;
pub mod host;
pub mod listener;
pub mod message;
pub mod message_stream;
pub mod multi_remote;
mod peer;
mod process;
pub mod reader;
pub mod remote;
pub mod request;
mod sequential_id_provider;
pub mod wrapper;

pub use class_registry::{reply, MethodError, RemoteObject, RpcClass};
pub use config::HostConfig;
pub use error::*;
pub use exec_remote::{parse_log_line, ChildLevel, ExecRemote};
pub use host::RpcHost;
pub use listener::RpcListener;
pub use message::{Args, Method, Params, PeerId, RequestId, RpcId, RpcResult, Status};
pub use multi_remote::MultiRemote;
pub use process::TERMINATE_GRACE;
pub use remote::{RpcRemote, LISTENER_PEER_ID};
pub use request::{Request, SharedRequest};
pub use wrapper::RpcObject;

/// Lock a mutex, ignoring poisoning. Every critical section leaves its data consistent
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
