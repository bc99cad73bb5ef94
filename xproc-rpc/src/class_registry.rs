use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt::Display,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Once},
};

use bson::Bson;
use log::{debug, trace, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    message::{Args, PeerId, RpcId, RpcResult, Status},
    sequential_id_provider::SequentialIdProvider,
};

/// Method dispatch failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MethodError {
    /// The class has no such remotely callable method
    #[error("No such method")]
    NotFound,
    /// Method ran and failed. Contains diagnostic text
    #[error("{0}")]
    Failed(String),
}

impl MethodError {
    pub fn failed(error: impl Display) -> Self {
        Self::Failed(error.to_string())
    }
}

/// Serialize a method return value
pub fn reply<T: Serialize>(value: &T) -> Result<Bson, MethodError> {
    bson::to_bson(value).map_err(|e| MethodError::Failed(format!("Invalid result: {e}")))
}

/// A class which can be served over RPC.
///
/// The `match` arms of [RpcClass::dispatch] define the set of remotely
/// callable methods. State has to live behind interior mutability, since
/// instances are shared between concurrent callers.
pub trait RpcClass: Send + Sync + Sized + 'static {
    /// Wire identifier of the class
    const CLASS_NAME: &'static str;

    /// Construct an instance from `create` arguments
    fn construct(args: Args) -> Result<Self, String>;

    /// Invoke a method by name
    fn dispatch(&self, method: &str, args: Args) -> Result<Bson, MethodError>;
}

/// Type-erased served instance
pub trait RemoteObject: Send + Sync {
    fn class_name(&self) -> &'static str;

    fn invoke(&self, method: &str, args: Args) -> Result<Bson, MethodError>;
}

impl<T: RpcClass> RemoteObject for T {
    fn class_name(&self) -> &'static str {
        T::CLASS_NAME
    }

    fn invoke(&self, method: &str, args: Args) -> Result<Bson, MethodError> {
        self.dispatch(method, args)
    }
}

pub(crate) type Factory =
    Arc<dyn Fn(Args) -> Result<Arc<dyn RemoteObject>, String> + Send + Sync>;

#[derive(Default)]
struct ClassEntry {
    /// This host constructs instances of the class
    local: bool,
    factory: Option<Factory>,
    /// Peers which announced they serve the class
    publishers: Vec<PeerId>,
}

/// Served classes by name
#[derive(Default)]
pub(crate) struct ClassRegistry {
    classes: HashMap<String, ClassEntry>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `T` locally constructible. Returns `false` if it already was
    pub fn publish_local<T: RpcClass>(&mut self) -> bool {
        let entry = self.classes.entry(T::CLASS_NAME.to_owned()).or_default();
        let changed = !entry.local;

        let factory: Factory = Arc::new(|args: Args| {
            T::construct(args).map(|instance| Arc::new(instance) as Arc<dyn RemoteObject>)
        });

        entry.local = true;
        entry.factory = Some(factory);

        debug!("Published `{}` locally", T::CLASS_NAME);
        changed
    }

    /// Returns `false` if the class wasn't local
    pub fn unpublish_local(&mut self, name: &str) -> bool {
        match self.classes.get_mut(name) {
            Some(entry) if entry.local => {
                entry.local = false;
                entry.factory = None;

                debug!("Unpublished `{name}`");
                true
            }
            _ => false,
        }
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.classes.get(name).map(|entry| entry.local).unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Sorted names of locally served classes
    pub fn local_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .classes
            .iter()
            .filter(|(_, entry)| entry.local)
            .map(|(name, _)| name.clone())
            .collect();

        names.sort();
        names
    }

    pub fn factory(&self, name: &str) -> Option<Factory> {
        self.classes
            .get(name)
            .filter(|entry| entry.local)
            .and_then(|entry| entry.factory.clone())
    }

    pub fn publishers(&self, name: &str) -> Vec<PeerId> {
        self.classes
            .get(name)
            .map(|entry| entry.publishers.clone())
            .unwrap_or_default()
    }

    /// Replace the set of classes served by `peer_id`. Unknown names get a
    /// registry entry, so they can be subscribed to
    pub fn set_peer_classes(&mut self, peer_id: PeerId, classes: &[String]) {
        for (name, entry) in self.classes.iter_mut() {
            if !classes.contains(name) {
                entry.publishers.retain(|publisher| *publisher != peer_id);
            }
        }

        for name in classes {
            let entry = self.classes.entry(name.clone()).or_default();

            if !entry.publishers.contains(&peer_id) {
                entry.publishers.push(peer_id);
            }
        }

        trace!("Peer {peer_id} serves {classes:?}");
    }

    /// Drop the peer from every publisher list
    pub fn remove_peer(&mut self, peer_id: PeerId) {
        for entry in self.classes.values_mut() {
            entry.publishers.retain(|publisher| *publisher != peer_id);
        }
    }

    /// Unpublish every local class and clear every publisher list
    pub fn clear(&mut self) {
        for entry in self.classes.values_mut() {
            entry.local = false;
            entry.factory = None;
            entry.publishers.clear();
        }
    }
}

/// Instances materialized in this host by rpcid
#[derive(Default)]
pub(crate) struct InstanceTable {
    ids: SequentialIdProvider,
    instances: HashMap<RpcId, Arc<dyn RemoteObject>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: Arc<dyn RemoteObject>) -> RpcId {
        let rpcid = self.ids.next_id();

        trace!("New `{}` instance {rpcid}", instance.class_name());
        self.instances.insert(rpcid, instance);

        rpcid
    }

    pub fn get(&self, rpcid: RpcId) -> Option<Arc<dyn RemoteObject>> {
        self.instances.get(&rpcid).cloned()
    }

    pub fn remove(&mut self, rpcid: RpcId) -> Option<Arc<dyn RemoteObject>> {
        self.instances.remove(&rpcid)
    }

    /// Number of live instances of the class
    pub fn count(&self, class_name: &str) -> usize {
        self.instances
            .values()
            .filter(|instance| instance.class_name() == class_name)
            .count()
    }

    /// Take every instance out. Instances must be dropped outside the host lock
    pub fn drain(&mut self) -> Vec<Arc<dyn RemoteObject>> {
        self.instances.drain().map(|(_, instance)| instance).collect()
    }
}

thread_local! {
    /// Set while a constructor or method runs on this thread
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Keep the backtrace of a panic inside a dispatched constructor or method,
/// so it can be reported to the caller. Panics elsewhere go straight to the
/// previous hook
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();

        panic::set_hook(Box::new(move |info| {
            if IN_DISPATCH.with(Cell::get) {
                let trace = format!("{info}\n{}", Backtrace::force_capture());
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }

            previous(info)
        }));
    });
}

/// Run `f` catching panics. On panic returns the message with a backtrace
fn catch_dispatch<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    install_panic_hook();
    PANIC_TRACE.with(|slot| slot.borrow_mut().take());

    // Restored afterwards, dispatch may nest through local proxies
    let outer = IN_DISPATCH.with(|flag| flag.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    IN_DISPATCH.with(|flag| flag.set(outer));

    result.map_err(|payload| {
        PANIC_TRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| panic_message(&*payload))
    })
}

/// Invoke an instance method, turning failures and panics into a failure result
pub(crate) fn invoke(instance: &dyn RemoteObject, method: &str, args: Args) -> RpcResult {
    match catch_dispatch(|| instance.invoke(method, args)) {
        Ok(Ok(value)) => RpcResult::ok(value),
        Ok(Err(MethodError::NotFound)) => RpcResult::failure(
            Status::MethodNotFound,
            format!("`{}` has no method `{method}`", instance.class_name()),
        ),
        Ok(Err(MethodError::Failed(text))) => RpcResult::failure(
            Status::MethodFailed,
            format!("{}.{method}: {text}", instance.class_name()),
        ),
        Err(trace) => {
            warn!("`{}.{method}` panicked", instance.class_name());
            RpcResult::failure(
                Status::MethodFailed,
                format!("{}.{method} panicked: {trace}", instance.class_name()),
            )
        }
    }
}

/// Run a constructor, turning failures and panics into a failure result
pub(crate) fn construct(
    factory: &Factory,
    args: Args,
) -> Result<Arc<dyn RemoteObject>, RpcResult> {
    match catch_dispatch(|| factory(args)) {
        Ok(Ok(instance)) => Ok(instance),
        Ok(Err(text)) => Err(RpcResult::failure(Status::MethodFailed, text)),
        Err(trace) => Err(RpcResult::failure(
            Status::MethodFailed,
            format!("Constructor panicked: {trace}"),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
