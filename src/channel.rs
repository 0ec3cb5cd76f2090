//! Six channel variants over {buffering} x {locking}, per the design's §4.A.
//!
//! `UNSYNC` backends use a bare `UnsafeCell` instead of a mutex. That is only
//! sound because a channel is only ever installed as `UNSYNC` when its two
//! endpoints run on the same activity thread (either chosen that way by the
//! caller, or downgraded there by the graph loader, §4.A "cross-activity
//! optimization") — read and write are then always serialized by the single
//! thread's step order and never actually execute concurrently.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferPolicy {
    /// Single-slot cell.
    Data,
    /// Bounded FIFO, rejects writes when full.
    Buffer,
    /// Bounded FIFO, overwrites the oldest element when full.
    Circular,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockPolicy {
    Unsync,
    Locked,
    LockFree,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    pub buffering: BufferPolicy,
    pub locking: LockPolicy,
    pub buffer_size: usize,
    pub transport: Transport,
    /// Discard-after-read vs retain, for `Data` channels. Not exposed by the
    /// graph spec today (§9 open question); defaults to retain.
    pub discard_after_read: bool,
}

impl ConnectionPolicy {
    pub fn data_locked() -> Self {
        Self {
            buffering: BufferPolicy::Data,
            locking: LockPolicy::Locked,
            buffer_size: 1,
            transport: Transport::Local,
            discard_after_read: false,
        }
    }

    pub fn data_unsync() -> Self {
        Self {
            locking: LockPolicy::Unsync,
            ..Self::data_locked()
        }
    }

    pub fn data_lock_free() -> Self {
        Self {
            locking: LockPolicy::LockFree,
            ..Self::data_locked()
        }
    }

    pub fn buffer(size: usize, locking: LockPolicy) -> Self {
        Self {
            buffering: BufferPolicy::Buffer,
            locking,
            buffer_size: size,
            transport: Transport::Local,
            discard_after_read: false,
        }
    }

    pub fn circular(size: usize, locking: LockPolicy) -> Self {
        Self {
            buffering: BufferPolicy::Circular,
            locking,
            buffer_size: size,
            transport: Transport::Local,
            discard_after_read: false,
        }
    }

    /// §4.A: `DATA + LOCK_FREE` collapses to a `CIRCULAR` of capacity 1.
    fn normalized(&self) -> ConnectionPolicy {
        if self.buffering == BufferPolicy::Data && self.locking == LockPolicy::LockFree {
            ConnectionPolicy {
                buffering: BufferPolicy::Circular,
                buffer_size: 1,
                ..*self
            }
        } else {
            *self
        }
    }

    pub(crate) fn downgraded_to_unsync(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            locking: LockPolicy::Unsync,
            ..*self
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    NoData,
    OldData,
    NewData,
}

/// Outcome of a `write`: whether it was accepted, and whether it left the
/// channel in a state that should trigger the input port (§4.A per-variant
/// trigger rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub accepted: bool,
    pub should_trigger: bool,
}

impl WriteOutcome {
    fn rejected() -> Self {
        Self {
            accepted: false,
            should_trigger: false,
        }
    }
}

struct Slot<T> {
    value: Option<T>,
    status: ChannelStatus,
}

enum SlotBackend<T> {
    Locked(Mutex<Slot<T>>),
    Unsync(UnsafeCell<Slot<T>>),
}

// Safety: `Unsync` is only constructed for same-thread endpoint pairs (see
// module docs); the kernel never shares such a channel across threads.
unsafe impl<T: Send> Sync for SlotBackend<T> {}

enum QueueBackend<T> {
    Locked(Mutex<VecDeque<T>>),
    Unsync(UnsafeCell<VecDeque<T>>),
    LockFree(ArrayQueue<T>),
}

unsafe impl<T: Send> Sync for QueueBackend<T> {}

enum Backend<T> {
    Slot(SlotBackend<T>),
    Buffer(QueueBackend<T>, usize),
    Circular(QueueBackend<T>, usize),
}

/// A typed directed edge between one output port and one input port.
///
/// Shared-owned between the two ports (§3): both sides hold an `Arc<Channel<T>>`.
pub struct Channel<T> {
    policy: ConnectionPolicy,
    backend: Backend<T>,
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T> Channel<T> {
    pub fn new(policy: ConnectionPolicy) -> Self {
        let policy = policy.normalized();
        let backend = match policy.buffering {
            BufferPolicy::Data => Backend::Slot(match policy.locking {
                LockPolicy::Locked => SlotBackend::Locked(Mutex::new(Slot {
                    value: None,
                    status: ChannelStatus::NoData,
                })),
                LockPolicy::Unsync => SlotBackend::Unsync(UnsafeCell::new(Slot {
                    value: None,
                    status: ChannelStatus::NoData,
                })),
                LockPolicy::LockFree => unreachable!("DATA+LOCK_FREE normalizes to CIRCULAR(1)"),
            }),
            BufferPolicy::Buffer => Backend::Buffer(
                match policy.locking {
                    LockPolicy::Locked => {
                        QueueBackend::Locked(Mutex::new(VecDeque::with_capacity(policy.buffer_size)))
                    }
                    LockPolicy::Unsync => {
                        QueueBackend::Unsync(UnsafeCell::new(VecDeque::with_capacity(policy.buffer_size)))
                    }
                    LockPolicy::LockFree => QueueBackend::LockFree(ArrayQueue::new(policy.buffer_size.max(1))),
                },
                policy.buffer_size,
            ),
            BufferPolicy::Circular => Backend::Circular(
                match policy.locking {
                    LockPolicy::Locked => {
                        QueueBackend::Locked(Mutex::new(VecDeque::with_capacity(policy.buffer_size)))
                    }
                    LockPolicy::Unsync => {
                        QueueBackend::Unsync(UnsafeCell::new(VecDeque::with_capacity(policy.buffer_size)))
                    }
                    LockPolicy::LockFree => QueueBackend::LockFree(ArrayQueue::new(policy.buffer_size.max(1))),
                },
                policy.buffer_size,
            ),
        };
        Self { policy, backend }
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    /// `write(&T) -> accepted | rejected`. Never blocks.
    pub fn write(&self, value: T) -> WriteOutcome
    where
        T: Clone,
    {
        match &self.backend {
            Backend::Slot(SlotBackend::Locked(m)) => {
                let mut slot = m.lock();
                let was_new = slot.status == ChannelStatus::NewData;
                slot.value = Some(value);
                slot.status = ChannelStatus::NewData;
                WriteOutcome {
                    accepted: true,
                    should_trigger: !was_new,
                }
            }
            // Safety: single-thread invariant, see module docs.
            Backend::Slot(SlotBackend::Unsync(cell)) => {
                let slot = unsafe { &mut *cell.get() };
                let was_new = slot.status == ChannelStatus::NewData;
                slot.value = Some(value);
                slot.status = ChannelStatus::NewData;
                WriteOutcome {
                    accepted: true,
                    should_trigger: !was_new,
                }
            }
            Backend::Buffer(QueueBackend::Locked(m), cap) => {
                let mut q = m.lock();
                if q.len() >= *cap {
                    return WriteOutcome::rejected();
                }
                q.push_back(value);
                WriteOutcome {
                    accepted: true,
                    should_trigger: q.len() < *cap,
                }
            }
            Backend::Buffer(QueueBackend::Unsync(cell), cap) => {
                let q = unsafe { &mut *cell.get() };
                if q.len() >= *cap {
                    return WriteOutcome::rejected();
                }
                q.push_back(value);
                WriteOutcome {
                    accepted: true,
                    should_trigger: q.len() < *cap,
                }
            }
            Backend::Buffer(QueueBackend::LockFree(q), cap) => match q.push(value) {
                Ok(()) => WriteOutcome {
                    accepted: true,
                    should_trigger: q.len() < *cap,
                },
                Err(_) => WriteOutcome::rejected(),
            },
            Backend::Circular(QueueBackend::Locked(m), cap) => {
                let mut q = m.lock();
                let displaced = q.len() >= *cap;
                if displaced {
                    q.pop_front();
                }
                q.push_back(value);
                WriteOutcome {
                    accepted: true,
                    should_trigger: !displaced,
                }
            }
            Backend::Circular(QueueBackend::Unsync(cell), cap) => {
                let q = unsafe { &mut *cell.get() };
                let displaced = q.len() >= *cap;
                if displaced {
                    q.pop_front();
                }
                q.push_back(value);
                WriteOutcome {
                    accepted: true,
                    should_trigger: !displaced,
                }
            }
            Backend::Circular(QueueBackend::LockFree(q), _cap) => {
                let mut displaced = false;
                let mut to_push = value;
                loop {
                    match q.push(to_push) {
                        Ok(()) => break,
                        Err(rejected) => {
                            displaced = true;
                            q.pop();
                            to_push = rejected;
                        }
                    }
                }
                WriteOutcome {
                    accepted: true,
                    should_trigger: !displaced,
                }
            }
        }
    }

    /// `read(&mut T) -> NEW_DATA | OLD_DATA | NO_DATA`.
    pub fn read(&self) -> (ChannelStatus, Option<T>)
    where
        T: Clone,
    {
        match &self.backend {
            Backend::Slot(SlotBackend::Locked(m)) => {
                let mut slot = m.lock();
                let status = slot.status;
                let value = slot.value.clone();
                if status == ChannelStatus::NewData {
                    slot.status = if self.policy.discard_after_read {
                        slot.value = None;
                        ChannelStatus::NoData
                    } else {
                        ChannelStatus::OldData
                    };
                }
                (status, value)
            }
            Backend::Slot(SlotBackend::Unsync(cell)) => {
                let slot = unsafe { &mut *cell.get() };
                let status = slot.status;
                let value = slot.value.clone();
                if status == ChannelStatus::NewData {
                    slot.status = if self.policy.discard_after_read {
                        slot.value = None;
                        ChannelStatus::NoData
                    } else {
                        ChannelStatus::OldData
                    };
                }
                (status, value)
            }
            Backend::Buffer(QueueBackend::Locked(m), _) => {
                let mut q = m.lock();
                match q.pop_front() {
                    Some(v) => (ChannelStatus::NewData, Some(v)),
                    None => (ChannelStatus::NoData, None),
                }
            }
            Backend::Buffer(QueueBackend::Unsync(cell), _) => {
                let q = unsafe { &mut *cell.get() };
                match q.pop_front() {
                    Some(v) => (ChannelStatus::NewData, Some(v)),
                    None => (ChannelStatus::NoData, None),
                }
            }
            Backend::Buffer(QueueBackend::LockFree(q), _) => match q.pop() {
                Some(v) => (ChannelStatus::NewData, Some(v)),
                None => (ChannelStatus::NoData, None),
            },
            Backend::Circular(QueueBackend::Locked(m), _) => {
                let mut q = m.lock();
                match q.pop_front() {
                    Some(v) => (ChannelStatus::NewData, Some(v)),
                    None => (ChannelStatus::NoData, None),
                }
            }
            Backend::Circular(QueueBackend::Unsync(cell), _) => {
                let q = unsafe { &mut *cell.get() };
                match q.pop_front() {
                    Some(v) => (ChannelStatus::NewData, Some(v)),
                    None => (ChannelStatus::NoData, None),
                }
            }
            Backend::Circular(QueueBackend::LockFree(q), _) => match q.pop() {
                Some(v) => (ChannelStatus::NewData, Some(v)),
                None => (ChannelStatus::NoData, None),
            },
        }
    }

    pub fn queue_length(&self) -> usize {
        match &self.backend {
            Backend::Slot(SlotBackend::Locked(m)) => {
                if m.lock().status == ChannelStatus::NoData {
                    0
                } else {
                    1
                }
            }
            Backend::Slot(SlotBackend::Unsync(cell)) => {
                if unsafe { &*cell.get() }.status == ChannelStatus::NoData {
                    0
                } else {
                    1
                }
            }
            Backend::Buffer(QueueBackend::Locked(m), _) | Backend::Circular(QueueBackend::Locked(m), _) => {
                m.lock().len()
            }
            Backend::Buffer(QueueBackend::Unsync(cell), _) | Backend::Circular(QueueBackend::Unsync(cell), _) => {
                unsafe { &*cell.get() }.len()
            }
            Backend::Buffer(QueueBackend::LockFree(q), _) | Backend::Circular(QueueBackend::LockFree(q), _) => {
                q.len()
            }
        }
    }

    pub fn has_new_data(&self) -> bool {
        match &self.backend {
            Backend::Slot(SlotBackend::Locked(m)) => m.lock().status == ChannelStatus::NewData,
            Backend::Slot(SlotBackend::Unsync(cell)) => unsafe { &*cell.get() }.status == ChannelStatus::NewData,
            _ => self.queue_length() > 0,
        }
    }

    /// Drains the buffer and returns only the last element. Used by farm
    /// gather paths that only care about the freshest sample.
    pub fn newest(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut last = None;
        while let (ChannelStatus::NewData, Some(v)) = self.read() {
            last = Some(v);
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_locked_retains_on_second_read() {
        let ch = Channel::<i32>::new(ConnectionPolicy::data_locked());
        assert_eq!(ch.write(7).should_trigger, true);
        assert_eq!(ch.read(), (ChannelStatus::NewData, Some(7)));
        assert_eq!(ch.read(), (ChannelStatus::OldData, Some(7)));
    }

    #[test]
    fn data_overwrite_same_cycle_does_not_retrigger() {
        let ch = Channel::<i32>::new(ConnectionPolicy::data_locked());
        assert!(ch.write(1).should_trigger);
        assert!(!ch.write(2).should_trigger);
    }

    #[test]
    fn buffer_rejects_when_full() {
        let ch = Channel::<i32>::new(ConnectionPolicy::buffer(2, LockPolicy::Locked));
        assert!(ch.write(1).accepted);
        assert!(ch.write(2).accepted);
        let third = ch.write(3);
        assert!(!third.accepted);
        assert!(!third.should_trigger);
    }

    #[test]
    fn circular_overwrites_oldest() {
        let ch = Channel::<i32>::new(ConnectionPolicy::circular(2, LockPolicy::Locked));
        ch.write(1);
        ch.write(2);
        let third = ch.write(3);
        assert!(third.accepted);
        assert!(!third.should_trigger);
        assert_eq!(ch.read().1, Some(2));
        assert_eq!(ch.read().1, Some(3));
    }

    #[test]
    fn lock_free_data_collapses_to_circular_one() {
        let ch = Channel::<i32>::new(ConnectionPolicy::data_lock_free());
        ch.write(1);
        ch.write(2);
        assert_eq!(ch.read().1, Some(2));
    }

    proptest::proptest! {
        #[test]
        fn circular_never_rejects_and_keeps_only_the_last_capacity_writes(
            values in proptest::collection::vec(0i32..1000, 0..64),
            capacity in 1usize..8,
        ) {
            let ch = Channel::<i32>::new(ConnectionPolicy::circular(capacity, LockPolicy::Locked));
            for v in &values {
                proptest::prop_assert!(ch.write(*v).accepted);
            }
            let mut drained = Vec::new();
            while let (ChannelStatus::NewData, Some(v)) = ch.read() {
                drained.push(v);
            }
            let expected: Vec<i32> = values
                .iter()
                .rev()
                .take(capacity)
                .rev()
                .copied()
                .collect();
            proptest::prop_assert_eq!(drained, expected);
        }
    }
}
