//! Read-only snapshots of a running graph (§6 "introspection surface",
//! exposed by the core to an external control plane over HTTP/WebSocket —
//! that transport layer itself is out of scope, §1).

use serde::{Deserialize, Serialize};

use crate::activity::{Activity, SchedulingKind};
use crate::channel::ConnectionPolicy;
use crate::component::{Component, LifecycleState};
use crate::engine::ExecutionEngine;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub policy: ConnectionPolicy,
    pub queue_length: usize,
    pub has_new_data: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortSnapshot {
    pub name: String,
    pub is_output: bool,
    pub is_event: bool,
    pub type_name: String,
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub class_name: String,
    pub instance_name: String,
    pub state: String,
    pub ports: Vec<PortSnapshot>,
    pub operations: Vec<String>,
    pub is_peer: bool,
}

impl ComponentSnapshot {
    pub fn capture(component: &Component) -> Self {
        let mut ports = Vec::new();
        for name in component.port_names() {
            if let Some(snap) = component.with_port(&name, |p| {
                let queue_lengths = p.queue_lengths();
                let policies = p.channel_policies();
                let new_data = p.has_new_data_flags();
                let connections = (0..queue_lengths.len())
                    .map(|i| ConnectionSnapshot {
                        policy: policies.get(i).copied().unwrap_or_else(ConnectionPolicy::data_locked),
                        queue_length: queue_lengths[i],
                        has_new_data: new_data.get(i).copied().unwrap_or(false),
                    })
                    .collect();
                PortSnapshot {
                    name: p.name().to_string(),
                    is_output: p.is_output(),
                    is_event: p.is_event(),
                    type_name: p.type_tag().to_string(),
                    connections,
                }
            }) {
                ports.push(snap);
            }
        }
        Self {
            class_name: component.id().class_name.clone(),
            instance_name: component.id().instance_name.clone(),
            state: lifecycle_state_name(component.state()).to_string(),
            ports,
            operations: component.list_operations(),
            is_peer: component.is_peer(),
        }
    }
}

fn lifecycle_state_name(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Init => "INIT",
        LifecycleState::PreOperational => "PRE_OPERATIONAL",
        LifecycleState::Running => "RUNNING",
        LifecycleState::Idle => "IDLE",
        LifecycleState::Stopped => "STOPPED",
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub iterations: u64,
    pub last: f64,
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub service_mean: f64,
    pub service_variance: f64,
}

impl EngineStatsSnapshot {
    pub fn capture(engine: &ExecutionEngine) -> Self {
        let stats = engine.stats();
        Self {
            iterations: stats.step.count(),
            last: stats.step.last(),
            mean: stats.step.mean(),
            variance: stats.step.variance(),
            min: stats.step.min(),
            max: stats.step.max(),
            service_mean: stats.service.mean(),
            service_variance: stats.service.variance(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub id: u32,
    pub is_periodic: bool,
    pub period_ms: Option<u64>,
    pub is_active: bool,
    pub pending_trigger: i64,
}

impl ActivitySnapshot {
    pub fn capture(activity: &Activity) -> Self {
        Self {
            id: activity.id().0,
            is_periodic: matches!(activity.policy().scheduling, SchedulingKind::Periodic),
            period_ms: activity.policy().period_ms,
            is_active: activity.is_active(),
            pending_trigger: activity.pending_trigger(),
        }
    }
}
