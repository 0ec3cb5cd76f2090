//! Per-port collection of channels plus a read/write strategy (§4.C).

use std::sync::Arc;

use crate::channel::{Channel, ChannelStatus, ConnectionPolicy, WriteOutcome};
use crate::component::EventSink;
use crate::ids::ComponentId;

/// An input endpoint's event-port binding, carried alongside its channel so
/// a write that triggers can call back without the output side knowing the
/// input port's concrete type (§4.B "Event ports").
#[derive(Clone)]
pub(crate) struct EventBinding {
    pub port_name: String,
    pub sink: Arc<dyn EventSink>,
}

/// Default input strategy: round-robin with eventual fairness (§4.C).
pub struct InputManager<T> {
    channels: Vec<Arc<Channel<T>>>,
    cursor: usize,
}

impl<T> Default for InputManager<T> {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            cursor: 0,
        }
    }
}

impl<T> InputManager<T> {
    pub fn add_channel(&mut self, channel: Arc<Channel<T>>) {
        self.channels.push(channel);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn queue_lengths(&self) -> Vec<usize> {
        self.channels.iter().map(|c| c.queue_length()).collect()
    }

    pub fn policies(&self) -> Vec<ConnectionPolicy> {
        self.channels.iter().map(|c| c.policy()).collect()
    }

    pub fn has_new_data_flags(&self) -> Vec<bool> {
        self.channels.iter().map(|c| c.has_new_data()).collect()
    }

    /// Scans every connection starting at the cursor for the first with new
    /// data; the cursor advances past it on a hit, or by one position on a
    /// miss, so `N` consecutive reads visit each of `N` connections at least
    /// once (§8 invariant 6) even when nothing ever has data.
    pub fn read(&mut self) -> (ChannelStatus, Option<T>)
    where
        T: Clone,
    {
        let n = self.channels.len();
        if n == 0 {
            return (ChannelStatus::NoData, None);
        }
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            let (status, value) = self.channels[idx].read();
            if status == ChannelStatus::NewData {
                self.cursor = (idx + 1) % n;
                return (status, value);
            }
        }
        self.cursor = (self.cursor + 1) % n;
        (ChannelStatus::NoData, None)
    }

    /// Drains every connection in declaration order. Does not touch the
    /// cursor (§9 open question, resolved as "no cursor change").
    pub fn read_all(&self) -> (ChannelStatus, Vec<T>)
    where
        T: Clone,
    {
        let mut out = Vec::new();
        for channel in &self.channels {
            if let (ChannelStatus::NewData, Some(value)) = channel.read() {
                out.push(value);
            }
        }
        let status = if out.is_empty() {
            ChannelStatus::NoData
        } else {
            ChannelStatus::NewData
        };
        (status, out)
    }
}

enum OutputStrategy {
    /// Broadcasts to all connections.
    Default,
    /// Load-balances across worker channels (§4.C "farm output manager").
    Farm { cursor: usize },
}

pub struct OutputManager<T> {
    channels: Vec<(Arc<Channel<T>>, ComponentId, Option<EventBinding>)>,
    strategy: OutputStrategy,
}

impl<T> Default for OutputManager<T> {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            strategy: OutputStrategy::Default,
        }
    }
}

impl<T> OutputManager<T> {
    pub fn farm() -> Self {
        Self {
            channels: Vec::new(),
            strategy: OutputStrategy::Farm { cursor: 0 },
        }
    }

    pub(crate) fn add_channel(
        &mut self,
        channel: Arc<Channel<T>>,
        input_owner: ComponentId,
        event_binding: Option<EventBinding>,
    ) {
        self.channels.push((channel, input_owner, event_binding));
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn queue_lengths(&self) -> Vec<usize> {
        self.channels.iter().map(|(c, ..)| c.queue_length()).collect()
    }

    pub fn policies(&self) -> Vec<ConnectionPolicy> {
        self.channels.iter().map(|(c, ..)| c.policy()).collect()
    }

    pub fn peers(&self) -> Vec<ComponentId> {
        self.channels.iter().map(|(_, id, _)| id.clone()).collect()
    }

    pub fn has_new_data_flags(&self) -> Vec<bool> {
        self.channels.iter().map(|(c, ..)| c.has_new_data()).collect()
    }

    pub fn write(&mut self, value: T) -> WriteOutcome
    where
        T: Clone,
    {
        match &mut self.strategy {
            OutputStrategy::Default => {
                let mut accepted = false;
                let mut should_trigger = false;
                for (channel, _, event) in &self.channels {
                    let r = channel.write(value.clone());
                    accepted |= r.accepted;
                    should_trigger |= r.should_trigger;
                    if r.should_trigger {
                        notify_event(event);
                    }
                }
                WriteOutcome {
                    accepted,
                    should_trigger,
                }
            }
            OutputStrategy::Farm { cursor } => farm_write(&self.channels, cursor, value),
        }
    }

    pub fn write_to(&mut self, value: T, task: &ComponentId) -> WriteOutcome {
        for (channel, owner, event) in &self.channels {
            if owner == task {
                let r = channel.write(value);
                if r.should_trigger {
                    notify_event(event);
                }
                return r;
            }
        }
        WriteOutcome {
            accepted: false,
            should_trigger: false,
        }
    }
}

fn notify_event(binding: &Option<EventBinding>) {
    if let Some(binding) = binding {
        binding.sink.on_event_fired(&binding.port_name);
    }
}

/// Tries the persistent cursor's candidate worker first; only if that one
/// isn't idle does it fall back to a linear scan for any empty channel.
/// Drops the write (returns not-accepted) if every worker is saturated.
fn farm_write<T>(
    channels: &[(Arc<Channel<T>>, ComponentId, Option<EventBinding>)],
    cursor: &mut usize,
    value: T,
) -> WriteOutcome {
    let n = channels.len();
    if n == 0 {
        return WriteOutcome {
            accepted: false,
            should_trigger: false,
        };
    }
    let candidate = *cursor % n;
    if channels[candidate].0.queue_length() == 0 {
        *cursor = (candidate + 1) % n;
        let r = channels[candidate].0.write(value);
        if r.should_trigger {
            notify_event(&channels[candidate].2);
        }
        return r;
    }
    for i in 1..=n {
        let idx = (candidate + i) % n;
        if channels[idx].0.queue_length() == 0 {
            *cursor = (idx + 1) % n;
            let r = channels[idx].0.write(value);
            if r.should_trigger {
                notify_event(&channels[idx].2);
            }
            return r;
        }
    }
    WriteOutcome {
        accepted: false,
        should_trigger: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionPolicy;

    #[test]
    fn round_robin_visits_every_connection() {
        let mut mgr = InputManager::<i32>::default();
        let channels: Vec<_> = (0..3)
            .map(|_| Arc::new(Channel::<i32>::new(ConnectionPolicy::data_locked())))
            .collect();
        for c in &channels {
            mgr.add_channel(c.clone());
        }
        channels[2].write(42);
        // Three consecutive reads starting at cursor 0 must eventually see it.
        let mut seen = None;
        for _ in 0..3 {
            let (status, value) = mgr.read();
            if status == ChannelStatus::NewData {
                seen = value;
            }
        }
        assert_eq!(seen, Some(42));
    }

    #[test]
    fn farm_prefers_idle_candidate_then_falls_back() {
        let mut mgr = OutputManager::<i32>::farm();
        let workers: Vec<_> = (0..3)
            .map(|i| {
                (
                    Arc::new(Channel::<i32>::new(ConnectionPolicy::buffer(1, crate::channel::LockPolicy::Locked))),
                    ComponentId::new("Worker", i.to_string()),
                )
            })
            .collect();
        for (c, id) in &workers {
            mgr.add_channel(c.clone(), id.clone(), None);
        }
        // Saturate worker 0.
        workers[0].0.write(1);
        let outcome = mgr.write(2);
        assert!(outcome.accepted);
        assert_eq!(workers[1].0.queue_length(), 1);
    }
}
