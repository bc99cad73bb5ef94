use std::{fmt, marker::PhantomData, time::Duration};

use bson::Bson;
use log::{debug, warn};
use serde::de::DeserializeOwned;

use crate::{
    class_registry::RpcClass,
    host::RpcHost,
    message::{Args, Params, PeerId, RpcId},
};

/// Where the instance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Local,
    Remote(PeerId),
}

/// Handle to an instance of `T`, either constructed in this host or in a peer.
///
/// Local instances are called in-process without wire marshalling, remote ones
/// through `call` requests to the owning peer. The instance is deleted when the
/// proxy is dropped; use [RpcObject::delete] to wait for the deletion.
pub struct RpcObject<T: RpcClass> {
    host: RpcHost,
    location: Location,
    rpcid: RpcId,
    timeout: Option<Duration>,
    deleted: bool,
    _class: PhantomData<fn() -> T>,
}

impl<T: RpcClass> RpcObject<T> {
    /// Construct an instance locally if `T` is published by this host,
    /// otherwise in the first peer which serves it
    pub fn create(host: &RpcHost, args: Args) -> crate::Result<Self> {
        if host.is_published_locally(T::CLASS_NAME) {
            let rpcid = parse_rpcid(host.handle_create(T::CLASS_NAME, args).into_result()?)?;

            debug!("Created local `{}` instance {rpcid}", T::CLASS_NAME);
            return Ok(Self::adopt(host, Location::Local, rpcid));
        }

        match host.publishers(T::CLASS_NAME).first() {
            Some(peer_id) => Self::create_on(host, *peer_id, args),
            None => Err(crate::Error::ClassNotFound(T::CLASS_NAME.into())),
        }
    }

    /// Construct an instance in the given peer
    pub fn create_on(host: &RpcHost, peer_id: PeerId, args: Args) -> crate::Result<Self> {
        let value = host.call(
            Params::Create {
                class: T::CLASS_NAME.into(),
                args,
            },
            peer_id,
            host.config().request_timeout,
        )?;

        let rpcid = parse_rpcid(value)?;

        debug!(
            "Created `{}` instance {rpcid} in peer {peer_id}",
            T::CLASS_NAME
        );
        Ok(Self::adopt(host, Location::Remote(peer_id), rpcid))
    }

    fn adopt(host: &RpcHost, location: Location, rpcid: RpcId) -> Self {
        Self {
            host: host.clone(),
            location,
            rpcid,
            timeout: host.config().request_timeout,
            deleted: false,
            _class: PhantomData,
        }
    }

    /// Override the host call timeout for this proxy
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rpcid(&self) -> RpcId {
        self.rpcid
    }

    /// Owning peer. `None` for a local instance
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.location {
            Location::Local => None,
            Location::Remote(peer_id) => Some(peer_id),
        }
    }

    pub fn is_local(&self) -> bool {
        self.location == Location::Local
    }

    /// Call a method and deserialize its result
    pub fn call<R: DeserializeOwned>(&self, method: &str, args: Args) -> crate::Result<R> {
        let value = self.call_raw(method, args)?;
        bson::from_bson(value).map_err(|e| crate::Error::ResultTypeError(e.to_string()))
    }

    /// Call a method, returning its raw result
    pub fn call_raw(&self, method: &str, args: Args) -> crate::Result<Bson> {
        match self.location {
            Location::Local => self.host.handle_call(self.rpcid, method, args).into_result(),
            Location::Remote(peer_id) => self.host.call(
                Params::Call {
                    rpcid: self.rpcid,
                    method: method.into(),
                    args,
                },
                peer_id,
                self.timeout,
            ),
        }
    }

    /// Delete the instance and wait until it's gone
    pub fn delete(mut self) -> crate::Result<()> {
        self.deleted = true;

        match self.location {
            Location::Local => self.host.handle_delete(self.rpcid).into_result().map(|_| ()),
            Location::Remote(peer_id) => self
                .host
                .call(Params::Delete { rpcid: self.rpcid }, peer_id, self.timeout)
                .map(|_| ()),
        }
    }
}

impl<T: RpcClass> fmt::Debug for RpcObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcObject")
            .field("class", &T::CLASS_NAME)
            .field("location", &self.location)
            .field("rpcid", &self.rpcid)
            .finish()
    }
}

impl<T: RpcClass> Drop for RpcObject<T> {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }

        match self.location {
            Location::Local => {
                self.host.forget_instance(self.rpcid);
            }
            Location::Remote(peer_id) => {
                if let Err(e) = self.host.notify(Params::Delete { rpcid: self.rpcid }, peer_id) {
                    debug!(
                        "Failed to delete `{}` instance {} in peer {peer_id}: {e}",
                        T::CLASS_NAME,
                        self.rpcid
                    );
                }
            }
        }
    }
}

fn parse_rpcid(value: Bson) -> crate::Result<RpcId> {
    match value {
        Bson::Int64(rpcid) => Ok(rpcid),
        Bson::Int32(rpcid) => Ok(rpcid.into()),
        other => {
            warn!("Invalid rpcid in a `create` response: {other}");
            Err(crate::Error::ResultTypeError(format!(
                "Expected an rpcid, got {other}"
            )))
        }
    }
}
