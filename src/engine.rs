//! Binds one `Component` to one `Activity` (§3 "Engine", §4.E).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info_span, warn};

use crate::component::{Component, LifecycleState};
use crate::error::KernelError;

/// Running statistics over step durations, kept with Welford's online
/// algorithm so no sample history needs to be retained (§4.E, §6
/// introspection surface). Two independent streams are tracked: the full
/// step (including pending-operation drain) and the "service time" (the
/// user `onUpdate` call alone).
#[derive(Clone, Debug, Default)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl Welford {
    fn observe(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
        self.last = x;
        if self.count == 1 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count as f64 - 1.0)
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub step: Welford,
    pub service: Welford,
}

impl EngineStats {
    fn record(&mut self, total_secs: f64, service_secs: f64) {
        self.step.observe(total_secs);
        self.service.observe(service_secs);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct ExecutionEngine {
    component: Arc<Component>,
    profiling_enabled: bool,
    stats: Mutex<EngineStats>,
    /// Latest stamped origin timestamp, nanoseconds since this engine's
    /// first step (§4.E "latency-propagation sub-mechanism"). `0` means
    /// unstamped.
    origin_timestamp_ns: AtomicU64,
    epoch: Instant,
}

impl ExecutionEngine {
    pub fn new(component: Arc<Component>, profiling_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            component,
            profiling_enabled,
            stats: Mutex::new(EngineStats::default()),
            origin_timestamp_ns: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        self.stats.lock().reset();
    }

    /// Stamps this engine as the origin of a latency measurement.
    pub fn mark_origin(&self) {
        let ns = self.epoch.elapsed().as_nanos() as u64;
        self.origin_timestamp_ns.store(ns, Ordering::Relaxed);
    }

    /// Copies a source engine's latest origin stamp onto this engine, as
    /// done by a channel `read` on the target side of a latency probe.
    pub fn propagate_from(&self, source: &ExecutionEngine) {
        let ns = source.origin_timestamp_ns.load(Ordering::Relaxed);
        self.origin_timestamp_ns.store(ns, Ordering::Relaxed);
    }

    pub fn latency_since_origin(&self) -> Option<std::time::Duration> {
        let origin = self.origin_timestamp_ns.load(Ordering::Relaxed);
        if origin == 0 {
            return None;
        }
        let now = self.epoch.elapsed().as_nanos() as u64;
        Some(std::time::Duration::from_nanos(now.saturating_sub(origin)))
    }

    /// §4.E: state INIT, user `onConfig`, state IDLE, then the registry is
    /// notified by the caller (graph loader) once every engine returns.
    pub fn init(&self) -> Result<(), KernelError> {
        self.component.set_state(LifecycleState::Init);
        let result = {
            let mut cb = self.component.callbacks.lock();
            cb.on_config()
        };
        if let Err(err) = &result {
            warn!(component = %self.component.id(), error = %err, "on_config failed");
        }
        self.component.set_state(LifecycleState::Idle);
        result
    }

    /// §4.E: drain pending operations one at a time under PRE_OPERATIONAL,
    /// then run the user `onUpdate` under RUNNING, then return to IDLE.
    pub fn step(&self) -> Result<(), KernelError> {
        let span = info_span!("engine_step", component = %self.component.id());
        let _guard = span.enter();

        let step_start = Instant::now();
        while self.component.has_pending_operations() {
            self.component.set_state(LifecycleState::PreOperational);
            if let Some(op) = self.component.drain_one_pending() {
                op();
            }
        }

        self.component.set_state(LifecycleState::Running);
        let service_start = Instant::now();
        let result = {
            let mut cb = self.component.callbacks.lock();
            cb.on_update()
        };
        let service_elapsed = service_start.elapsed();
        let total_elapsed = step_start.elapsed();

        if self.profiling_enabled {
            self.stats
                .lock()
                .record(total_elapsed.as_secs_f64(), service_elapsed.as_secs_f64());
        }

        if let Err(err) = &result {
            warn!(component = %self.component.id(), error = %err, "on_update failed");
        }
        self.component.set_state(LifecycleState::Idle);
        result
    }

    /// §4.E: call user `stop` only if not already STOPPED.
    pub fn finalize(&self) -> Result<(), KernelError> {
        if self.component.state() == LifecycleState::Stopped {
            return Ok(());
        }
        let result = {
            let mut cb = self.component.callbacks.lock();
            cb.on_stop()
        };
        if let Err(err) = &result {
            warn!(component = %self.component.id(), error = %err, "on_stop failed");
        }
        self.component.set_state(LifecycleState::Stopped);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentCallbacks};
    use crate::ids::ComponentId;
    use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};

    struct CountingCallbacks {
        updates: Arc<AtomicI32>,
    }

    impl ComponentCallbacks for CountingCallbacks {
        fn on_update(&mut self) -> Result<(), KernelError> {
            self.updates.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn step_cycles_through_running_back_to_idle() {
        let updates = Arc::new(AtomicI32::new(0));
        let component = Component::new(
            ComponentId::new("Counter", "c0"),
            Box::new(CountingCallbacks { updates: updates.clone() }),
            false,
        );
        let engine = ExecutionEngine::new(component.clone(), true);
        engine.init().unwrap();
        assert_eq!(component.state(), LifecycleState::Idle);
        engine.step().unwrap();
        assert_eq!(component.state(), LifecycleState::Idle);
        assert_eq!(updates.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(engine.stats().step.count(), 1);
    }

    #[test]
    fn finalize_is_idempotent_once_stopped() {
        let updates = Arc::new(AtomicI32::new(0));
        let component = Component::new(
            ComponentId::new("Counter", "c1"),
            Box::new(CountingCallbacks { updates }),
            false,
        );
        let engine = ExecutionEngine::new(component.clone(), false);
        engine.init().unwrap();
        engine.finalize().unwrap();
        assert_eq!(component.state(), LifecycleState::Stopped);
        // Second finalize must not call on_stop again or panic on transition.
        engine.finalize().unwrap();
    }

    #[test]
    fn pending_operation_drains_before_running_phase() {
        let updates = Arc::new(AtomicI32::new(0));
        let component = Component::new(
            ComponentId::new("Counter", "c2"),
            Box::new(CountingCallbacks { updates }),
            false,
        );
        component
            .register_operation::<i32, i32>("double", |x| x * 2)
            .unwrap();
        let observed = Arc::new(AtomicI32::new(0));
        let observed_clone = observed.clone();
        component
            .enqueue_operation_then::<i32, i32, _>("double", 21, move |ret| {
                observed_clone.store(ret, AtomicOrdering::SeqCst);
            })
            .unwrap();

        let engine = ExecutionEngine::new(component.clone(), false);
        engine.init().unwrap();
        engine.step().unwrap();
        // The continuation closure requeues during drain and is drained by
        // the same while-loop within one step.
        assert_eq!(observed.load(AtomicOrdering::SeqCst), 42);
    }
}
