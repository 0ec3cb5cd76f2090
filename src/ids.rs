use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a `Component`: (class-name, instance-name). Instance names are
/// unique within a graph (§3).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId {
    pub class_name: String,
    pub instance_name: String,
}

impl ComponentId {
    pub fn new(class_name: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            instance_name: instance_name.into(),
        }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instance_name)
    }
}

/// Process-unique activity id, handed out by a monotonically increasing
/// counter (§3, §4.G "global bookkeeping").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityId(pub u32);

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "activity-{}", self.0)
    }
}

#[derive(Default)]
pub(crate) struct ActivityIdAllocator {
    next: std::sync::atomic::AtomicU32,
}

impl ActivityIdAllocator {
    pub fn allocate(&self) -> ActivityId {
        ActivityId(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}
