use std::fmt;

use crate::port::PortTypeTag;

/// Every fallible outcome the kernel can produce, grouped by §7 of the design.
///
/// `ConfigError`, `WiringError` and `AffinityError` are fatal at graph-load
/// time: callers should abort the load rather than run a partial graph.
/// `ResourceError` is recoverable and only ever logged via `tracing::warn!`.
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Wiring(#[from] WiringError),
    #[error(transparent)]
    Affinity(#[from] AffinityError),
    #[error("attribute {attr} on component {component} could not be resolved as a file: {path}")]
    Resource {
        component: String,
        attr: String,
        path: String,
    },
    #[error("operation {0} not found on this component")]
    OperationNotFound(String),
    #[error("operation {name} called with mismatched argument type")]
    OperationTypeMismatch { name: String },
    #[error("failed to spawn activity thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("user callback in component {component} failed: {source}")]
    UserCallback {
        component: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("duplicate component instance name: {0}")]
    DuplicateInstance(String),
    #[error("duplicate port {port} on component {component}")]
    DuplicatePort { component: String, port: String },
    #[error("duplicate attribute {attr} on component {component}")]
    DuplicateAttribute { component: String, attr: String },
    #[error("duplicate operation {op} on component {component}")]
    DuplicateOperation { component: String, op: String },
    #[error("unknown attribute {attr} on component {component}")]
    UnknownAttribute { component: String, attr: String },
    #[error("unknown component class: {0}")]
    UnknownClass(String),
    #[error("unknown component instance: {0}")]
    UnknownInstance(String),
    #[error("failed to load library {0}")]
    LibraryLoadFailed(String),
    #[error("adding this connection would have created a cycle")]
    WouldCycle,
    #[error("only one sequential activity is permitted per process")]
    MultipleSequentialActivities,
}

#[derive(thiserror::Error, Debug)]
pub enum WiringError {
    #[error("port type mismatch connecting {from} ({from_type}) to {to} ({to_type})")]
    TypeMismatch {
        from: String,
        from_type: PortTypeTag,
        to: String,
        to_type: PortTypeTag,
    },
    #[error("direction mismatch connecting {from} to {to}: both ports have the same polarity")]
    DirectionMismatch { from: String, to: String },
    #[error("cannot connect two ports belonging to the same component: {0}")]
    SameComponent(String),
    #[error("port {port} not found on task {task}")]
    PortNotFound { task: String, port: String },
}

#[derive(thiserror::Error, Debug)]
pub enum AffinityError {
    #[error("core id {0} is out of range for this machine")]
    OutOfRange(usize),
    #[error("core id {0} is already exclusively claimed by another activity")]
    AlreadyClaimed(usize),
}

impl From<daggy::WouldCycle<crate::graph::EdgeLabel>> for KernelError {
    fn from(_: daggy::WouldCycle<crate::graph::EdgeLabel>) -> Self {
        KernelError::Config(ConfigError::WouldCycle)
    }
}

/// Marker used where the spec calls for a write that is silently rejected
/// rather than an error: `ChannelFull` (bounded, non-circular) and farm
/// drops under saturation. Not a `KernelError` variant because callers are
/// expected to branch on a `bool`/`FlowStatus`, not on `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFull;

impl fmt::Display for ChannelFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel is full")
    }
}
