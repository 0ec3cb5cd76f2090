//! Typed port/connection layer (§4.B). A port belongs to exactly one
//! component, carries a payload type `T`, and is either an input or an
//! output, optionally an event port.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::channel::{Channel, ConnectionPolicy};
use crate::component::EventSink;
use crate::connection_manager::{InputManager, OutputManager};
use crate::error::{KernelError, WiringError};
use crate::ids::ComponentId;

pub use crate::channel::ChannelStatus as FlowStatus;

/// A dynamic type tag for cross-boundary equality checks at wiring time
/// (§9 "polymorphism across typed ports"). Defaults to `type_name::<T>()`
/// but can be overridden to distinguish logical sub-types that share a
/// Rust representation (e.g. two `i64` ports meaning different units).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortTypeTag(pub Cow<'static, str>);

impl PortTypeTag {
    pub fn of<T: ?Sized>() -> Self {
        Self(Cow::Borrowed(std::any::type_name::<T>()))
    }

    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for PortTypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-generic facet of a port, used by the graph loader (§4.G) to wire
/// components whose concrete port types are only known through a registry
/// lookup (`Box<dyn Any>`), not at compile time.
pub trait ErasedPort: Any + Send {
    fn name(&self) -> &str;
    fn owner(&self) -> &ComponentId;
    fn is_output(&self) -> bool;
    fn is_event(&self) -> bool;
    fn type_tag(&self) -> &PortTypeTag;
    fn queue_lengths(&self) -> Vec<usize>;
    fn channel_policies(&self) -> Vec<ConnectionPolicy>;
    fn has_new_data_flags(&self) -> Vec<bool>;
    /// For output ports: the owning component of each connected input, in
    /// connection order. Empty for input ports (§6 introspection surface).
    fn peer_components(&self) -> Vec<ComponentId>;
    /// Binds an input event port's trigger callback (§4.B). No-op on output
    /// ports and on non-event input ports.
    fn bind_event_sink(&mut self, sink: Arc<dyn EventSink>);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Connects `self` (assumed output) to `other` (assumed input), or vice
    /// versa — direction is resolved dynamically. Performs the identity
    /// checks from §4.B (`connect_to`) before attempting a downcast to a
    /// concrete `Port<T>` pair.
    fn connect_dyn(
        &mut self,
        other: &mut dyn ErasedPort,
        policy: ConnectionPolicy,
    ) -> Result<(), KernelError>;
}

fn check_identity(a: &dyn ErasedPort, b: &dyn ErasedPort) -> Result<(), KernelError> {
    if a.owner() == b.owner() {
        return Err(WiringError::SameComponent(a.owner().to_string()).into());
    }
    if a.is_output() == b.is_output() {
        return Err(WiringError::DirectionMismatch {
            from: a.name().to_string(),
            to: b.name().to_string(),
        }
        .into());
    }
    if a.type_tag() != b.type_tag() {
        return Err(WiringError::TypeMismatch {
            from: a.name().to_string(),
            from_type: a.type_tag().clone(),
            to: b.name().to_string(),
            to_type: b.type_tag().clone(),
        }
        .into());
    }
    Ok(())
}

pub struct OutputPort<T> {
    name: String,
    owner: ComponentId,
    is_event: bool,
    type_tag: PortTypeTag,
    pub(crate) manager: OutputManager<T>,
}

impl<T> OutputPort<T> {
    pub fn new(name: impl Into<String>, owner: ComponentId, is_event: bool) -> Self {
        Self {
            name: name.into(),
            owner,
            is_event,
            type_tag: PortTypeTag::of::<T>(),
            manager: OutputManager::default(),
        }
    }

    pub fn farm(name: impl Into<String>, owner: ComponentId, is_event: bool) -> Self {
        let mut p = Self::new(name, owner, is_event);
        p.manager = OutputManager::farm();
        p
    }

    pub fn with_type_tag(mut self, tag: PortTypeTag) -> Self {
        self.type_tag = tag;
        self
    }

    /// Broadcasts to every connection; succeeds if any connection accepted.
    pub fn write(&mut self, value: T) -> bool
    where
        T: Clone,
    {
        self.manager.write(value).accepted
    }

    /// Writes only to the connection whose input endpoint belongs to `task`.
    pub fn write_to(&mut self, value: T, task: &ComponentId) -> bool {
        self.manager.write_to(value, task).accepted
    }

    pub fn connect_to(
        &mut self,
        input: &mut InputPort<T>,
        policy: ConnectionPolicy,
    ) -> Result<(), KernelError> {
        check_identity(self, input)?;
        let ch = Arc::new(Channel::new(policy));
        let binding = event_binding_for(input);
        self.manager.add_channel(ch.clone(), input.owner.clone(), binding);
        input.manager.add_channel(ch);
        Ok(())
    }
}

fn event_binding_for<T>(input: &InputPort<T>) -> Option<crate::connection_manager::EventBinding> {
    if !input.is_event {
        return None;
    }
    input.event_sink().map(|sink| crate::connection_manager::EventBinding {
        port_name: input.name.clone(),
        sink,
    })
}

impl<T: Send + 'static> ErasedPort for OutputPort<T> {
    fn name(&self) -> &str {
        &self.name
    }
    fn owner(&self) -> &ComponentId {
        &self.owner
    }
    fn is_output(&self) -> bool {
        true
    }
    fn is_event(&self) -> bool {
        self.is_event
    }
    fn type_tag(&self) -> &PortTypeTag {
        &self.type_tag
    }
    fn queue_lengths(&self) -> Vec<usize> {
        self.manager.queue_lengths()
    }
    fn channel_policies(&self) -> Vec<ConnectionPolicy> {
        self.manager.policies()
    }
    fn has_new_data_flags(&self) -> Vec<bool> {
        self.manager.has_new_data_flags()
    }
    fn peer_components(&self) -> Vec<ComponentId> {
        self.manager.peers()
    }
    fn bind_event_sink(&mut self, _sink: Arc<dyn EventSink>) {}
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn connect_dyn(
        &mut self,
        other: &mut dyn ErasedPort,
        policy: ConnectionPolicy,
    ) -> Result<(), KernelError> {
        check_identity(self, other)?;
        let input = other.as_any_mut().downcast_mut::<InputPort<T>>().ok_or_else(|| {
            KernelError::from(WiringError::TypeMismatch {
                from: self.name.clone(),
                from_type: self.type_tag.clone(),
                to: other.name().to_string(),
                to_type: other.type_tag().clone(),
            })
        })?;
        let ch = Arc::new(Channel::new(policy));
        let binding = event_binding_for(input);
        self.manager.add_channel(ch.clone(), input.owner.clone(), binding);
        input.manager.add_channel(ch);
        Ok(())
    }
}

pub struct InputPort<T> {
    name: String,
    owner: ComponentId,
    is_event: bool,
    type_tag: PortTypeTag,
    pub(crate) manager: InputManager<T>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl<T> InputPort<T> {
    pub fn new(name: impl Into<String>, owner: ComponentId, is_event: bool) -> Self {
        Self {
            name: name.into(),
            owner,
            is_event,
            type_tag: PortTypeTag::of::<T>(),
            manager: InputManager::default(),
            event_sink: None,
        }
    }

    pub fn with_type_tag(mut self, tag: PortTypeTag) -> Self {
        self.type_tag = tag;
        self
    }

    /// Binds the owning component as this port's event sink, so a write
    /// that triggers can call back into it (§4.B "Event ports"). Typically
    /// called once, right after the owning `Component` is constructed.
    pub fn bind_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.event_sink = Some(sink);
    }

    pub(crate) fn event_sink(&self) -> Option<Arc<dyn EventSink>> {
        self.event_sink.clone()
    }

    /// Walks connections round-robin from the manager's cursor; returns the
    /// first `NEW_DATA` sample found, advancing the cursor past it. If none
    /// have new data the cursor still advances by one (§4.C fairness). On
    /// an event port, a consuming read balances the trigger count the
    /// corresponding write incremented (§4.B).
    pub fn read(&mut self) -> (FlowStatus, Option<T>)
    where
        T: Clone,
    {
        let result = self.manager.read();
        if self.is_event && result.0 == FlowStatus::NewData {
            if let Some(sink) = &self.event_sink {
                sink.on_event_consumed();
            }
        }
        result
    }

    /// Drains every connection in declaration order. Does not move the
    /// round-robin cursor (§9 open question, resolved as "no cursor change").
    pub fn read_all(&self) -> (FlowStatus, Vec<T>)
    where
        T: Clone,
    {
        self.manager.read_all()
    }
}

impl<T: Send + 'static> ErasedPort for InputPort<T> {
    fn name(&self) -> &str {
        &self.name
    }
    fn owner(&self) -> &ComponentId {
        &self.owner
    }
    fn is_output(&self) -> bool {
        false
    }
    fn is_event(&self) -> bool {
        self.is_event
    }
    fn type_tag(&self) -> &PortTypeTag {
        &self.type_tag
    }
    fn queue_lengths(&self) -> Vec<usize> {
        self.manager.queue_lengths()
    }
    fn channel_policies(&self) -> Vec<ConnectionPolicy> {
        self.manager.policies()
    }
    fn has_new_data_flags(&self) -> Vec<bool> {
        self.manager.has_new_data_flags()
    }
    fn peer_components(&self) -> Vec<ComponentId> {
        Vec::new()
    }
    fn bind_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.event_sink = Some(sink);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn connect_dyn(
        &mut self,
        other: &mut dyn ErasedPort,
        policy: ConnectionPolicy,
    ) -> Result<(), KernelError> {
        // `check_identity` rejects two input ports (same direction) before we
        // ever delegate — otherwise a malformed spec resolving both ends to
        // inputs would bounce back and forth between the two `connect_dyn`
        // calls forever.
        check_identity(self, other)?;
        other.connect_dyn(self, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionPolicy;

    #[test]
    fn connect_rejects_same_component() {
        let owner = ComponentId::new("Echo", "a");
        let mut out = OutputPort::<i32>::new("out", owner.clone(), false);
        let mut inp = InputPort::<i32>::new("in", owner, false);
        let err = out.connect_to(&mut inp, ConnectionPolicy::data_locked());
        assert!(matches!(err, Err(KernelError::Wiring(WiringError::SameComponent(_)))));
    }

    #[test]
    fn connect_rejects_type_mismatch_over_erasure() {
        let mut out: Box<dyn ErasedPort> =
            Box::new(OutputPort::<i32>::new("out", ComponentId::new("A", "a"), false));
        let mut inp: Box<dyn ErasedPort> =
            Box::new(InputPort::<String>::new("in", ComponentId::new("B", "b"), false));
        let err = out.connect_dyn(inp.as_mut(), ConnectionPolicy::data_locked());
        assert!(matches!(err, Err(KernelError::Wiring(WiringError::TypeMismatch { .. }))));
    }
}
