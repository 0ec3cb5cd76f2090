//! The component (task) contract (§3, §4.D): lifecycle state machine,
//! pending-operation queue, peer hierarchy, attributes, operations, ports.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::activity::Activity;
use crate::attribute::{unknown_attribute, AttributeValue};
use crate::error::{ConfigError, KernelError};
use crate::ids::ComponentId;
use crate::operation::{Operation, OperationQueue, PendingOp};
use crate::port::ErasedPort;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    PreOperational,
    Running,
    Idle,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Init => "INIT",
            LifecycleState::PreOperational => "PRE_OPERATIONAL",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Idle => "IDLE",
            LifecycleState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// §3 invariant 5: transitions form a DAG, never backwards.
pub(crate) fn is_valid_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
        (from, to),
        (Init, PreOperational)
            | (Init, Idle)
            | (PreOperational, Idle)
            | (PreOperational, Running)
            | (PreOperational, PreOperational)
            | (Idle, PreOperational)
            | (Idle, Running)
            | (Running, PreOperational)
            | (Running, Idle)
            | (Idle, Idle)
            | (Running, Stopped)
            | (Idle, Stopped)
            | (Init, Stopped)
    )
}

/// User-supplied lifecycle callbacks for one component (§4.D, §4.E).
pub trait ComponentCallbacks: Send {
    /// Runs once, on the main thread, before any activity spawns (§4.G step 3).
    fn init(&mut self) -> Result<(), KernelError> {
        Ok(())
    }
    /// Runs once the component's engine starts, after every component's
    /// `init` has completed.
    fn on_config(&mut self) -> Result<(), KernelError> {
        Ok(())
    }
    fn on_update(&mut self) -> Result<(), KernelError>;
    /// Called by the engine's `finalize` unless already `STOPPED`.
    fn on_stop(&mut self) -> Result<(), KernelError> {
        Ok(())
    }
}

/// A component with no peers and no wiring of its own; useful in tests and
/// as the default for pure sink/source stubs.
pub struct NoopCallbacks;
impl ComponentCallbacks for NoopCallbacks {
    fn on_update(&mut self) -> Result<(), KernelError> {
        Ok(())
    }
}

/// The port-side half of the write/read → Component callback chain (§4.B
/// "Event ports"). A port holds an `Arc<dyn EventSink>` bound to its owner
/// once the owner is known, so `write`/`read` can call back without the
/// port needing to know `Component`'s concrete type.
pub trait EventSink: Send + Sync {
    /// A write left the channel in a trigger-emitting state.
    fn on_event_fired(&self, port_name: &str);
    /// A read consumed new data on an event port; balances the trigger
    /// count the corresponding fire incremented (§4.F `remove_trigger`).
    fn on_event_consumed(&self);
}

impl EventSink for Component {
    fn on_event_fired(&self, port_name: &str) {
        if self.on_event_port_fired(port_name) {
            if let Some(activity) = self.activity() {
                activity.trigger();
            }
        }
    }

    fn on_event_consumed(&self) {
        if let Some(activity) = self.activity() {
            activity.remove_trigger();
        }
    }
}

pub struct Component {
    id: ComponentId,
    state: AtomicCell<LifecycleState>,
    pub(crate) callbacks: Mutex<Box<dyn ComponentCallbacks>>,
    ports: Mutex<HashMap<String, Box<dyn ErasedPort>>>,
    attributes: Mutex<HashMap<String, Box<dyn AttributeValue>>>,
    operations: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    pub(crate) pending: Arc<OperationQueue>,
    peers: Mutex<Vec<Arc<Component>>>,
    parent: Mutex<Option<Weak<Component>>>,
    activity: Mutex<Option<Weak<Activity>>>,
    wait_all_trigger: bool,
    event_port_count: AtomicUsize,
    pending_event_ports: Mutex<HashSet<String>>,
    forward_check: AtomicBool,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id)
            .field("state", &self.state.load())
            .finish()
    }
}

impl Component {
    pub fn new(id: ComponentId, callbacks: Box<dyn ComponentCallbacks>, wait_all_trigger: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicCell::new(LifecycleState::Init),
            callbacks: Mutex::new(callbacks),
            ports: Mutex::new(HashMap::new()),
            attributes: Mutex::new(HashMap::new()),
            operations: Mutex::new(HashMap::new()),
            pending: Arc::new(OperationQueue::default()),
            peers: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
            activity: Mutex::new(None),
            wait_all_trigger,
            event_port_count: AtomicUsize::new(0),
            pending_event_ports: Mutex::new(HashSet::new()),
            forward_check: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    /// Sets the state, checked against the DAG of valid transitions (§3
    /// invariant 5). Only the owning `ExecutionEngine`/`Activity` should
    /// call this; a violation is a framework bug, hence the panic.
    pub(crate) fn set_state(&self, to: LifecycleState) {
        let from = self.state.load();
        if from != to {
            assert!(
                is_valid_transition(from, to),
                "illegal lifecycle transition on {}: {from} -> {to}",
                self.id
            );
        }
        self.state.store(to);
    }

    // --- Ports -----------------------------------------------------------

    pub fn add_port(self: &Arc<Self>, mut port: Box<dyn ErasedPort>) -> Result<(), KernelError> {
        let name = port.name().to_string();
        let is_event = port.is_event();
        if is_event && !port.is_output() {
            port.bind_event_sink(self.clone());
        }
        let mut ports = self.ports.lock();
        if ports.contains_key(&name) {
            return Err(ConfigError::DuplicatePort {
                component: self.id.to_string(),
                port: name,
            }
            .into());
        }
        if is_event {
            self.event_port_count.fetch_add(1, Ordering::SeqCst);
        }
        ports.insert(name, port);
        Ok(())
    }

    pub fn with_port<R>(&self, name: &str, f: impl FnOnce(&mut dyn ErasedPort) -> R) -> Option<R> {
        let mut ports = self.ports.lock();
        ports.get_mut(name).map(|p| f(p.as_mut()))
    }

    pub fn port_names(&self) -> Vec<String> {
        self.ports.lock().keys().cloned().collect()
    }

    pub fn has_any_connected_port(&self) -> bool {
        self.ports.lock().values().any(|p| !p.queue_lengths().is_empty())
    }

    // --- Attributes --------------------------------------------------------

    pub fn add_attribute(&self, name: impl Into<String>, value: Box<dyn AttributeValue>) -> Result<(), KernelError> {
        let name = name.into();
        let mut attrs = self.attributes.lock();
        if attrs.contains_key(&name) {
            return Err(ConfigError::DuplicateAttribute {
                component: self.id.to_string(),
                attr: name,
            }
            .into());
        }
        attrs.insert(name, value);
        Ok(())
    }

    pub fn set_attribute_text(&self, name: &str, text: &str) -> Result<(), KernelError> {
        let mut attrs = self.attributes.lock();
        let attr = attrs
            .get_mut(name)
            .ok_or_else(|| unknown_attribute(&self.id.to_string(), name))?;
        attr.set_from_text(text)
    }

    pub fn get_attribute_text(&self, name: &str) -> Result<String, KernelError> {
        let attrs = self.attributes.lock();
        let attr = attrs
            .get(name)
            .ok_or_else(|| unknown_attribute(&self.id.to_string(), name))?;
        Ok(attr.to_text())
    }

    pub fn with_attribute<R>(&self, name: &str, f: impl FnOnce(&mut dyn AttributeValue) -> R) -> Option<R> {
        let mut attrs = self.attributes.lock();
        attrs.get_mut(name).map(|a| f(a.as_mut()))
    }

    // --- Operations ----------------------------------------------------

    pub fn register_operation<Args, Ret>(
        &self,
        name: impl Into<String>,
        func: impl Fn(Args) -> Ret + Send + Sync + 'static,
    ) -> Result<(), KernelError>
    where
        Args: 'static,
        Ret: 'static,
    {
        let name = name.into();
        let mut ops = self.operations.lock();
        if ops.contains_key(&name) {
            return Err(ConfigError::DuplicateOperation {
                component: self.id.to_string(),
                op: name,
            }
            .into());
        }
        ops.insert(name.clone(), Arc::new(Operation::new(name, func)));
        Ok(())
    }

    pub fn list_operations(&self) -> Vec<String> {
        self.operations.lock().keys().cloned().collect()
    }

    fn get_operation<Args, Ret>(&self, name: &str) -> Result<Arc<Operation<Args, Ret>>, KernelError>
    where
        Args: 'static,
        Ret: 'static,
    {
        let erased = {
            let ops = self.operations.lock();
            ops.get(name)
                .cloned()
                .ok_or_else(|| KernelError::OperationNotFound(name.to_string()))?
        };
        erased
            .downcast::<Operation<Args, Ret>>()
            .map_err(|_| KernelError::OperationTypeMismatch { name: name.to_string() })
    }

    /// Synchronous call: retrieves the typed callable and invokes it inline.
    pub fn call_sync<Args, Ret>(&self, name: &str, args: Args) -> Result<Ret, KernelError>
    where
        Args: 'static,
        Ret: 'static,
    {
        Ok(self.get_operation::<Args, Ret>(name)?.call(args))
    }

    /// Asynchronous call: enqueues a zero-argument closure on the pending
    /// queue, drained on a later `PRE_OPERATIONAL` phase (§4.D).
    pub fn enqueue_operation<Args, Ret>(&self, name: &str, args: Args) -> Result<(), KernelError>
    where
        Args: Send + 'static,
        Ret: Send + 'static,
    {
        let op = self.get_operation::<Args, Ret>(name)?;
        self.pending.push(Box::new(move || {
            op.call(args);
        }));
        Ok(())
    }

    /// Two-phase variant: the first closure invokes the operation and pushes
    /// a second closure — holding the continuation and the return value —
    /// back onto the same queue.
    pub fn enqueue_operation_then<Args, Ret, Cont>(
        &self,
        name: &str,
        args: Args,
        cont: Cont,
    ) -> Result<(), KernelError>
    where
        Args: Send + 'static,
        Ret: Send + 'static,
        Cont: FnOnce(Ret) + Send + 'static,
    {
        let op = self.get_operation::<Args, Ret>(name)?;
        let pending = self.pending.clone();
        self.pending.push(Box::new(move || {
            let ret = op.call(args);
            pending.push(Box::new(move || cont(ret)));
        }));
        Ok(())
    }

    pub(crate) fn drain_one_pending(&self) -> Option<PendingOp> {
        self.pending.drain_one()
    }

    pub fn has_pending_operations(&self) -> bool {
        !self.pending.is_empty()
    }

    // --- Peers -----------------------------------------------------------

    /// Attaches `child` as a peer of `self`. One-shot: panics if `child`
    /// already has a parent (§4.D, §9 "peer back-pointers").
    pub fn add_peer(self: &Arc<Self>, child: Arc<Component>) {
        let mut parent_slot = child.parent.lock();
        assert!(parent_slot.is_none(), "peer {} already has a parent", child.id());
        *parent_slot = Some(Arc::downgrade(self));
        drop(parent_slot);
        self.peers.lock().push(child);
    }

    pub fn peers(&self) -> Vec<Arc<Component>> {
        self.peers.lock().clone()
    }

    pub fn is_peer(&self) -> bool {
        self.parent.lock().is_some()
    }

    /// The activity driving this component, delegating to the parent's if
    /// this is a peer (§4.D "Peer").
    pub fn activity(&self) -> Option<Arc<Activity>> {
        if let Some(parent) = self.parent.lock().as_ref().and_then(Weak::upgrade) {
            return parent.activity();
        }
        self.activity.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Set exactly once, before `start` (§3 invariant 1). A peer's slot is
    /// never populated directly; it delegates through `activity()`.
    pub(crate) fn bind_activity(&self, activity: &Arc<Activity>) {
        let mut slot = self.activity.lock();
        assert!(slot.is_none(), "activity already bound for {}", self.id);
        *slot = Some(Arc::downgrade(activity));
    }

    // --- Event-port trigger coalescing (§4.D) -----------------------------

    /// Called when an event input port receives new data. Returns whether
    /// the owning activity should be triggered now.
    pub fn on_event_port_fired(&self, port_name: &str) -> bool {
        if !self.wait_all_trigger {
            return true;
        }
        let mut pending = self.pending_event_ports.lock();
        let count = self.event_port_count.load(Ordering::SeqCst);
        if self.forward_check.load(Ordering::SeqCst) {
            pending.insert(port_name.to_string());
            if pending.len() == count {
                self.forward_check.store(false, Ordering::SeqCst);
                return true;
            }
        } else {
            pending.remove(port_name);
            if pending.is_empty() {
                self.forward_check.store(true, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    /// Runs the user's one-shot `init` callback. Called by the graph loader
    /// on the main thread, in declaration order, before any activity spawns
    /// (§4.D, §4.G step 3) — distinct from the engine's later `on_config`.
    pub fn run_init(&self) -> Result<(), KernelError> {
        self.callbacks.lock().init()
    }

    pub fn wait_all_trigger(&self) -> bool {
        self.wait_all_trigger
    }

    pub fn event_port_count(&self) -> usize {
        self.event_port_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(id: &str, wait_all: bool) -> Arc<Component> {
        Component::new(ComponentId::new("Test", id), Box::new(NoopCallbacks), wait_all)
    }

    #[test]
    fn wait_all_with_single_port_triggers_every_time() {
        let c = mk("k", true);
        c.event_port_count.store(1, Ordering::SeqCst);
        assert!(c.on_event_port_fired("p1"));
        assert!(c.on_event_port_fired("p1"));
        assert!(c.on_event_port_fired("p1"));
    }

    #[test]
    fn wait_all_coalesces_a_full_round_into_one_trigger() {
        let c = mk("k", true);
        c.event_port_count.store(2, Ordering::SeqCst);
        assert!(!c.on_event_port_fired("p1"));
        for _ in 0..4 {
            assert!(!c.on_event_port_fired("p1"));
        }
        // p2 firing completes the round (pending == {p1, p2}, len == count).
        assert!(c.on_event_port_fired("p2"));
        for _ in 0..4 {
            assert!(!c.on_event_port_fired("p2"));
        }
        // one more p2 does not retrigger; only draining p1 does.
        assert!(!c.on_event_port_fired("p2"));
        assert!(c.on_event_port_fired("p1"));
    }

    #[test]
    fn peer_cannot_be_reattached() {
        let parent_a = mk("a", false);
        let parent_b = mk("b", false);
        let child = mk("c", false);
        parent_a.add_peer(child.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            parent_b.add_peer(child.clone());
        }));
        assert!(result.is_err());
    }
}
