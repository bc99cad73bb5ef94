use std::{
    collections::HashMap,
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bson::Bson;
use log::{debug, error, info, trace, warn};
use once_cell::sync::OnceCell;
use xproc_worker_pool::WorkerPool;

use crate::{
    calls_registry::CallsRegistry,
    class_registry::{self, ClassRegistry, InstanceTable, RpcClass},
    config::HostConfig,
    lock,
    message::{Origin, Params, PeerId, RequestState, RpcId, RpcMessage, RpcResult, Status},
    message_stream::{decode_message, encode_message},
    peer::Peer,
    reader::PeerReader,
    request::{
        Request, SharedRequest, STAMP_CALLEE_DONE, STAMP_CALLEE_RECEIVED, STAMP_CALLER_SENT,
    },
    sequential_id_provider::SequentialIdProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    /// Running the shutdown protocol
    Exiting,
    /// Farewells are done. Waiting for dispatch workers to return
    Draining,
    Stopped,
}

struct HostState {
    lifecycle: Lifecycle,
    peers: HashMap<PeerId, Arc<Peer>>,
    calls: CallsRegistry,
    classes: ClassRegistry,
    instances: InstanceTable,
}

struct HostInner {
    config: HostConfig,
    state: Mutex<HostState>,
    /// Notified on every response, peer change, registry change and lifecycle change
    changed: Condvar,
    request_ids: SequentialIdProvider,
    /// Own identity as seen by the peers
    peer_id: OnceCell<PeerId>,
    stop_requested: AtomicBool,
    exit_requested: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Per-process RPC router.
///
/// Owns peer connections, matches responses to pending requests by request id,
/// and dispatches incoming requests to local instances. Cheap to clone: all
/// clones share the same host.
///
/// The host reads frames with a [WorkerPool] of [PeerReader] workers: the active
/// worker polls every managed socket and reads one frame, while other workers
/// dispatch the frames they've already read.
#[derive(Clone)]
pub struct RpcHost {
    inner: Arc<HostInner>,
}

impl RpcHost {
    pub fn new(config: HostConfig) -> Self {
        let peer_id = OnceCell::new();
        if config.master {
            let _ = peer_id.set(0);
        }

        Self {
            inner: Arc::new(HostInner {
                config,
                state: Mutex::new(HostState {
                    lifecycle: Lifecycle::Idle,
                    peers: HashMap::new(),
                    calls: CallsRegistry::new(),
                    classes: ClassRegistry::new(),
                    instances: InstanceTable::new(),
                }),
                changed: Condvar::new(),
                request_ids: SequentialIdProvider::new(),
                peer_id,
                stop_requested: AtomicBool::new(false),
                exit_requested: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn is_master(&self) -> bool {
        self.inner.config.master
    }

    /// Own peer id. Known after the `ready` handshake, or `0` for a listener
    pub fn peer_id(&self) -> Option<PeerId> {
        self.inner.peer_id.get().copied()
    }

    pub(crate) fn set_peer_id(&self, peer_id: PeerId) {
        if self.inner.peer_id.set(peer_id).is_err() && self.peer_id() != Some(peer_id) {
            warn!(
                "Host `{}` already has peer id {:?}. Ignoring {peer_id}",
                self.name(),
                self.peer_id()
            );
        }
    }

    /// Spawn the host thread running [RpcHost::run]
    pub fn start(&self) -> crate::Result<()> {
        let mut thread_lock = lock(&self.inner.thread);

        if thread_lock.is_some() || self.lock().lifecycle != Lifecycle::Idle {
            return Err(crate::Error::InternalError(format!(
                "Host `{}` has been started already",
                self.name()
            )));
        }

        let host = self.clone();
        let handle = thread::Builder::new()
            .name(self.name().to_owned())
            .spawn(move || host.run())
            .map_err(|e| crate::Error::SpawnFailed(e.to_string()))?;

        *thread_lock = Some(handle);
        Ok(())
    }

    /// Host loop. Reads and dispatches incoming frames until [RpcHost::finish]
    /// is called or an exit is requested, then runs the shutdown protocol
    pub fn run(&self) {
        {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Idle {
                warn!("Host `{}` is running or stopped already", self.name());
                return;
            }

            state.lifecycle = Lifecycle::Running;
        }

        info!("Host `{}` started", self.name());

        let mut pool = {
            let host = self.clone();

            match WorkerPool::new(self.inner.config.pool_config(), move || {
                PeerReader::new(host.clone())
            }) {
                Ok(pool) => pool,
                Err(e) => {
                    error!("Failed to start host `{}` workers: {e}", self.name());
                    self.teardown();
                    return;
                }
            }
        };

        {
            let mut state = self.lock();

            while !self.stop_requested() && !self.exit_requested() {
                state = self.wait_changed(state, self.inner.config.poll_interval);
            }
        }

        self.shutdown_protocol();
        self.drain();
        pool.finish();
        self.teardown();

        info!("Host `{}` stopped", self.name());
    }

    /// Stop the host and wait for the host thread.
    /// Runs the shutdown protocol unless the host was never started
    pub fn finish(&self) {
        self.inner.stop_requested.store(true, Ordering::Release);
        self.inner.changed.notify_all();

        let never_started = lock(&self.inner.thread).is_none();
        let idle = self.lock().lifecycle == Lifecycle::Idle;

        if never_started && idle {
            self.teardown();
            return;
        }

        self.join();
    }

    /// Wait until the host thread returns
    pub fn join(&self) {
        let handle = lock(&self.inner.thread).take();

        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Host `{}` thread panicked", self.name());
            }
        }
    }

    /// Ask the host loop to exit, as if the master sent an `exit_request`
    pub fn request_exit(&self) {
        self.inner.exit_requested.store(true, Ordering::Release);
        self.inner.changed.notify_all();
    }

    pub fn exit_requested(&self) -> bool {
        self.inner.exit_requested.load(Ordering::Acquire)
    }

    /// Block until an exit is requested or the host stops.
    /// Returns `false` on timeout
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();

        loop {
            if self.exit_requested() || state.lifecycle == Lifecycle::Stopped {
                return true;
            }

            let mut interval = self.inner.config.poll_interval;

            if let Some(deadline) = deadline {
                let now = Instant::now();

                if now >= deadline {
                    return false;
                }

                interval = interval.min(deadline - now);
            }

            state = self.wait_changed(state, interval);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Stopped
    }

    fn stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::Acquire)
    }

    fn is_exiting(&self) -> bool {
        self.stop_requested()
            || self.exit_requested()
            || matches!(
                self.lock().lifecycle,
                Lifecycle::Exiting | Lifecycle::Draining | Lifecycle::Stopped
            )
    }

    /// Start serving a connection as `peer_id`
    pub fn manage(&self, peer_id: PeerId, stream: UnixStream) -> crate::Result<()> {
        let peer = Arc::new(Peer::new(
            peer_id,
            stream,
            self.inner.config.frame_read_timeout,
        )?);

        {
            let mut state = self.lock();

            if state.lifecycle == Lifecycle::Stopped {
                return Err(crate::Error::HostStopped);
            }

            if state.peers.contains_key(&peer_id) {
                return Err(crate::Error::PeerAlreadyManaged(peer_id));
            }

            state.peers.insert(peer_id, peer);
        }

        info!("Host `{}` manages peer {peer_id}", self.name());
        self.inner.changed.notify_all();

        Ok(())
    }

    /// Forget a peer: drop it from every publisher list, fail its pending
    /// requests and shut its socket down. Returns `false` if not managed
    pub fn unmanage(&self, peer_id: PeerId) -> bool {
        let peer = {
            let mut state = self.lock();
            let peer = state.peers.remove(&peer_id);

            if peer.is_some() {
                state.classes.remove_peer(peer_id);
                state.calls.fail_peer(peer_id);
            }

            peer
        };

        let Some(peer) = peer else {
            return false;
        };

        peer.close();
        self.inner.changed.notify_all();

        info!("Host `{}` unmanaged peer {peer_id}", self.name());
        true
    }

    /// Transport failure on the peer socket
    pub(crate) fn peer_died(&self, peer_id: PeerId) {
        if !self.unmanage(peer_id) {
            return;
        }

        warn!("Host `{}` lost peer {peer_id}", self.name());

        if !self.is_master() && peer_id == 0 && !self.is_exiting() {
            info!("Host `{}` lost its master. Exiting", self.name());
            self.request_exit();
        }
    }

    /// Sorted ids of managed peers
    pub fn managed_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.lock().peers.keys().copied().collect();
        peers.sort();
        peers
    }

    pub(crate) fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.lock().peers.values().cloned().collect();
        peers.sort_by_key(|peer| peer.id());
        peers
    }

    fn peer(&self, peer_id: PeerId) -> crate::Result<Arc<Peer>> {
        self.lock()
            .peers
            .get(&peer_id)
            .cloned()
            .ok_or(crate::Error::NoSuchPeer(peer_id))
    }

    /// Send a request to the peer. A caller-side request gets a new request
    /// id and stays pending until its response arrives, see [RpcHost::wait]
    pub fn put(&self, request: &SharedRequest, peer_id: PeerId) -> crate::Result<()> {
        let peer = match self.peer(peer_id) {
            Ok(peer) => peer,
            Err(e) => {
                fail_request(request);
                return Err(e);
            }
        };

        let (message, pending_id) = {
            let mut request = lock(request);

            if request.origin == Origin::Caller {
                request.request_id = Some(self.inner.request_ids.next_id());
                request.state = RequestState::Submitted;
                request.stamp(STAMP_CALLER_SENT);
            }

            let pending_id = match request.origin {
                Origin::Caller => request.request_id,
                Origin::Callee => None,
            };

            (request.to_message(), pending_id)
        };

        let payload = match encode_message(&message) {
            Ok(payload) => payload,
            Err(e) => {
                fail_request(request);
                return Err(e);
            }
        };

        if let Some(request_id) = pending_id {
            let mut state = self.lock();

            if matches!(state.lifecycle, Lifecycle::Draining | Lifecycle::Stopped) {
                drop(state);
                fail_request(request);
                return Err(crate::Error::HostStopped);
            }

            // Registered before writing, so the response can't outrun it.
            // Checked under the lock, so a concurrent unmanage fails it
            if !state.peers.contains_key(&peer_id) {
                drop(state);
                fail_request(request);
                return Err(crate::Error::NoSuchPeer(peer_id));
            }

            state.calls.add_call(request_id, peer_id, request.clone());
        }

        debug!(
            "Host `{}` sends {} {:?} to peer {peer_id}",
            self.name(),
            message.method,
            message.request_id
        );

        if let Err(e) = peer.send(&payload) {
            debug!("Failed to write to peer {peer_id}: {e}");
            self.peer_died(peer_id);
            fail_request(request);

            return Err(crate::Error::PeerDisconnected);
        }

        Ok(())
    }

    /// Block until the request is resolved.
    ///
    /// Returns [crate::Error::PeerDisconnected] if the request failed,
    /// [crate::Error::Timeout] if `timeout` elapsed, in which case the request
    /// is failed and a late response is dropped. Returns
    /// [crate::Error::HostStopped] once the shutdown protocol is over.
    pub fn wait(&self, request: &SharedRequest, timeout: Option<Duration>) -> crate::Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();

        loop {
            let (request_state, request_id) = {
                let request = lock(request);
                (request.state, request.request_id)
            };

            match request_state {
                RequestState::ResponseRcvd => return Ok(()),
                RequestState::RpcError => return Err(crate::Error::PeerDisconnected),
                _ => {}
            }

            if matches!(state.lifecycle, Lifecycle::Draining | Lifecycle::Stopped) {
                if let Some(request_id) = request_id {
                    state.calls.remove(request_id);
                }
                drop(state);

                fail_request(request);
                return Err(crate::Error::HostStopped);
            }

            let mut interval = self.inner.config.poll_interval;

            if let Some(deadline) = deadline {
                let now = Instant::now();

                if now >= deadline {
                    if let Some(request_id) = request_id {
                        state.calls.remove(request_id);
                    }
                    drop(state);

                    fail_request(request);
                    debug!("Request {request_id:?} timed out");

                    return Err(crate::Error::Timeout);
                }

                interval = interval.min(deadline - now);
            }

            state = self.wait_changed(state, interval);
        }
    }

    /// Send a request and wait for its result
    pub fn call(
        &self,
        params: Params,
        peer_id: PeerId,
        timeout: Option<Duration>,
    ) -> crate::Result<Bson> {
        let request = Request::shared(params);

        self.put(&request, peer_id)?;
        self.wait(&request, timeout)?;

        let result = lock(&request).result.take();
        result
            .ok_or_else(|| crate::Error::InternalError("Response without a result".into()))?
            .into_result()
    }

    /// Send a request without waiting for its response
    pub(crate) fn notify(&self, params: Params, peer_id: PeerId) -> crate::Result<()> {
        self.put(&Request::shared(params), peer_id)
    }

    /// Handle one raw frame payload from the peer
    pub fn dispatch_rpcdata(&self, data: &[u8], peer_id: PeerId) {
        let request = match decode_message(data).and_then(Request::from_message) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping invalid frame from peer {peer_id}: {e}");
                return;
            }
        };

        trace!("Incoming frame from peer {peer_id}: {request:?}");

        match request.origin {
            Origin::Callee => self.resolve(request, peer_id),
            Origin::Caller => self.respond(request, peer_id),
        }
    }

    fn resolve(&self, response: Request, peer_id: PeerId) {
        let Some(request_id) = response.request_id else {
            warn!("Response without a request id from peer {peer_id}");
            return;
        };

        debug!("Response to {request_id} from peer {peer_id}");

        if self.lock().calls.resolve(request_id, response) {
            self.inner.changed.notify_all();
        }
    }

    fn respond(&self, mut request: Request, peer_id: PeerId) {
        debug!(
            "Host `{}` handles {} {:?} from peer {peer_id}",
            self.name(),
            request.method(),
            request.request_id
        );

        request.stamp(STAMP_CALLEE_RECEIVED);
        request.state = RequestState::ResponsePend;

        self.handle_request(&mut request, peer_id);

        request.stamp(STAMP_CALLEE_DONE);
        request.state = RequestState::ResponseDone;
        request.origin = Origin::Callee;

        if request.request_id.is_none() {
            return;
        }

        if let Err(e) = self.send_message(peer_id, &request.to_message()) {
            debug!("Failed to respond to peer {peer_id}: {e}");
        }
    }

    fn send_message(&self, peer_id: PeerId, message: &RpcMessage) -> crate::Result<()> {
        let peer = self.peer(peer_id)?;
        let payload = encode_message(message)?;

        if let Err(e) = peer.send(&payload) {
            self.peer_died(peer_id);
            return Err(e);
        }

        Ok(())
    }

    /// Execute an incoming request and store its result.
    /// Clears the request id of requests which get no response
    pub fn handle_request(&self, request: &mut Request, peer_id: PeerId) {
        let result = match &request.params {
            Params::Create { class, args } => self.handle_create(class, args.clone()),
            Params::Delete { rpcid } => self.handle_delete(*rpcid),
            Params::Call {
                rpcid,
                method,
                args,
            } => self.handle_call(*rpcid, method, args.clone()),
            Params::Publish { classes } => {
                self.lock().classes.set_peer_classes(peer_id, classes);
                self.inner.changed.notify_all();

                RpcResult::ok(Bson::Null)
            }
            Params::Ready => RpcResult::ok(Bson::Int64(i64::from(peer_id))),
            Params::ExitRequest => {
                if !self.is_exiting() {
                    info!("Peer {peer_id} requested host `{}` exit", self.name());
                    self.request_exit();
                }

                RpcResult::ok(Bson::Null)
            }
            Params::ExitNotify => {
                info!("Peer {peer_id} is leaving");
                self.unmanage(peer_id);

                RpcResult::ok(Bson::Null)
            }
            Params::NodeStatus(_) => RpcResult::ok(Bson::Null),
        };

        if matches!(request.params, Params::ExitRequest | Params::ExitNotify) {
            request.request_id = None;
        }

        request.result = Some(result);
    }

    pub(crate) fn handle_create(&self, class: &str, args: crate::message::Args) -> RpcResult {
        let factory = self.lock().classes.factory(class);

        let Some(factory) = factory else {
            debug!("Request to create unpublished class `{class}`");

            return RpcResult::failure(
                Status::ClassNotFound,
                format!("Class `{class}` is not published by host `{}`", self.name()),
            );
        };

        match class_registry::construct(&factory, args) {
            Ok(instance) => {
                let rpcid = self.lock().instances.insert(instance);
                RpcResult::ok(Bson::Int64(rpcid))
            }
            Err(failure) => failure,
        }
    }

    pub(crate) fn handle_delete(&self, rpcid: RpcId) -> RpcResult {
        // Dropped after the lock is released
        let removed = self.lock().instances.remove(rpcid);

        match removed {
            Some(_) => RpcResult::ok(Bson::Boolean(true)),
            None => RpcResult::failure(Status::MethodNotFound, format!("No instance {rpcid}")),
        }
    }

    pub(crate) fn handle_call(&self, rpcid: RpcId, method: &str, args: crate::message::Args) -> RpcResult {
        let instance = self.lock().instances.get(rpcid);

        match instance {
            Some(instance) => class_registry::invoke(&*instance, method, args),
            None => RpcResult::failure(Status::MethodNotFound, format!("No instance {rpcid}")),
        }
    }

    /// Serve `T` from this host and announce it to every peer
    pub fn publish<T: RpcClass>(&self) {
        if self.lock().classes.publish_local::<T>() {
            info!("Host `{}` publishes `{}`", self.name(), T::CLASS_NAME);
            self.broadcast_classes();
        }

        self.inner.changed.notify_all();
    }

    /// Stop serving `T` and announce it to every peer
    pub fn unpublish<T: RpcClass>(&self) {
        self.unpublish_class(T::CLASS_NAME)
    }

    pub fn unpublish_class(&self, name: &str) {
        if self.lock().classes.unpublish_local(name) {
            info!("Host `{}` unpublishes `{name}`", self.name());
            self.broadcast_classes();
        }
    }

    /// Block until some peer serves `T`, or it's published locally
    pub fn subscribe<T: RpcClass>(&self, timeout: Option<Duration>) -> crate::Result<()> {
        self.subscribe_class(T::CLASS_NAME, timeout)
    }

    pub fn subscribe_class(&self, name: &str, timeout: Option<Duration>) -> crate::Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();

        loop {
            if state.classes.is_local(name) || !state.classes.publishers(name).is_empty() {
                debug!("Subscribed to `{name}`");
                return Ok(());
            }

            if matches!(state.lifecycle, Lifecycle::Draining | Lifecycle::Stopped) {
                return Err(crate::Error::HostStopped);
            }

            let mut interval = self.inner.config.poll_interval;

            if let Some(deadline) = deadline {
                let now = Instant::now();

                if now >= deadline {
                    return Err(crate::Error::Timeout);
                }

                interval = interval.min(deadline - now);
            }

            state = self.wait_changed(state, interval);
        }
    }

    /// Peers which announced they serve the class
    pub fn publishers(&self, name: &str) -> Vec<PeerId> {
        self.lock().classes.publishers(name)
    }

    pub fn is_published_locally(&self, name: &str) -> bool {
        self.lock().classes.is_local(name)
    }

    /// The class is local, or announced by some peer at some point
    pub fn knows_class(&self, name: &str) -> bool {
        self.lock().classes.contains(name)
    }

    /// Number of live local instances of the class
    pub fn instance_count(&self, name: &str) -> usize {
        self.lock().instances.count(name)
    }

    pub fn pending_calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub(crate) fn forget_instance(&self, rpcid: RpcId) -> bool {
        let removed = self.lock().instances.remove(rpcid);
        removed.is_some()
    }

    /// Send the list of local classes to the peer
    pub fn announce(&self, peer_id: PeerId) -> crate::Result<()> {
        let classes = self.lock().classes.local_classes();

        trace!("Announcing {classes:?} to peer {peer_id}");
        self.notify(Params::Publish { classes }, peer_id)
    }

    fn broadcast_classes(&self) {
        for peer_id in self.managed_peers() {
            if let Err(e) = self.announce(peer_id) {
                warn!("Failed to announce classes to peer {peer_id}: {e}");
            }
        }
    }

    /// Master asks every peer to exit, others say goodbye to the master.
    /// Waits end when the other side closes the connection
    fn shutdown_protocol(&self) {
        self.set_lifecycle(Lifecycle::Exiting);

        let timeout = Some(self.inner.config.shutdown_timeout);
        let mut farewells = Vec::new();

        if self.is_master() {
            for peer_id in self.managed_peers() {
                let request = Request::shared(Params::ExitRequest);

                match self.put(&request, peer_id) {
                    Ok(()) => farewells.push((peer_id, request)),
                    Err(e) => debug!("Failed to send exit request to peer {peer_id}: {e}"),
                }
            }
        } else if self.managed_peers().contains(&0) {
            let request = Request::shared(Params::ExitNotify);

            match self.put(&request, 0) {
                Ok(()) => farewells.push((0, request)),
                Err(e) => debug!("Failed to notify master about exit: {e}"),
            }
        }

        for (peer_id, request) in farewells {
            match self.wait(&request, timeout) {
                Err(crate::Error::Timeout) => {
                    warn!("Peer {peer_id} didn't close its connection in time")
                }
                _ => debug!("Peer {peer_id} is gone"),
            }
        }
    }

    /// Fail every pending call, so dispatch workers blocked in nested calls
    /// return and the pool can finish
    fn drain(&self) {
        {
            let mut state = self.lock();
            state.lifecycle = Lifecycle::Draining;
            state.calls.clear_pending_calls();
        }

        self.inner.changed.notify_all();
    }

    /// Drop every peer, class and instance. The host can't be restarted
    fn teardown(&self) {
        let (peers, instances) = {
            let mut state = self.lock();

            state.lifecycle = Lifecycle::Stopped;
            state.classes.clear();
            state.calls.clear_pending_calls();

            let peers: Vec<Arc<Peer>> = state.peers.drain().map(|(_, peer)| peer).collect();
            (peers, state.instances.drain())
        };

        for peer in peers {
            peer.close();
        }

        drop(instances);
        self.inner.changed.notify_all();
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lock().lifecycle = lifecycle;
        self.inner.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_changed<'a>(
        &self,
        state: MutexGuard<'a, HostState>,
        interval: Duration,
    ) -> MutexGuard<'a, HostState> {
        match self.inner.changed.wait_timeout(state, interval) {
            Ok((state, _)) => state,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

fn fail_request(request: &SharedRequest) {
    let mut request = lock(request);

    if !request.is_terminal() {
        request.state = RequestState::RpcError;
    }
}
