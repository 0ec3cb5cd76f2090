//! The scheduling layer (§3 "Activity", §4.F). An `Activity` is a thread of
//! control — either the caller's own thread (`Sequential`) or one it owns
//! (`Parallel`) — driving an ordered list of `ExecutionEngine`s.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::engine::ExecutionEngine;
use crate::error::{AffinityError, KernelError};
use crate::ids::ActivityId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingKind {
    Periodic,
    Triggered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealtimeClass {
    None,
    Fifo,
    Rr,
    Deadline,
}

/// §3 "SchedulePolicy".
#[derive(Clone, Debug)]
pub struct SchedulePolicy {
    pub scheduling: SchedulingKind,
    pub period_ms: Option<u64>,
    pub realtime: RealtimeClass,
    pub priority: i32,
    pub runtime_ns: Option<u64>,
    pub deadline_ns: Option<u64>,
    pub affinity: Option<usize>,
    pub exclusive_affinity: Option<usize>,
    /// Cores not exclusively claimed by any activity; filled in by the
    /// graph loader's global bookkeeping pass before any activity starts.
    pub available_core_id: HashSet<usize>,
}

impl SchedulePolicy {
    pub fn periodic(period_ms: u64) -> Self {
        Self {
            scheduling: SchedulingKind::Periodic,
            period_ms: Some(period_ms),
            realtime: RealtimeClass::None,
            priority: 0,
            runtime_ns: None,
            deadline_ns: None,
            affinity: None,
            exclusive_affinity: None,
            available_core_id: HashSet::new(),
        }
    }

    pub fn triggered() -> Self {
        Self {
            scheduling: SchedulingKind::Triggered,
            period_ms: None,
            realtime: RealtimeClass::None,
            priority: 0,
            runtime_ns: None,
            deadline_ns: None,
            affinity: None,
            exclusive_affinity: None,
            available_core_id: HashSet::new(),
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.scheduling == SchedulingKind::Periodic
    }
}

struct ParallelState {
    handle: StdMutex<Option<JoinHandle<()>>>,
    mutex: StdMutex<()>,
    cond: Condvar,
    pending_trigger: AtomicI64,
}

enum ActivityKind {
    Sequential,
    Parallel(ParallelState),
}

/// Owns the engines it drives; see §4.F for the per-kind entry procedures.
pub struct Activity {
    id: ActivityId,
    policy: SchedulePolicy,
    engines: Vec<Arc<ExecutionEngine>>,
    active: AtomicBool,
    stopping: AtomicBool,
    kind: ActivityKind,
}

impl Activity {
    pub fn new_sequential(id: ActivityId, policy: SchedulePolicy, engines: Vec<Arc<ExecutionEngine>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            policy,
            engines,
            active: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            kind: ActivityKind::Sequential,
        })
    }

    pub fn new_parallel(id: ActivityId, policy: SchedulePolicy, engines: Vec<Arc<ExecutionEngine>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            policy,
            engines,
            active: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            kind: ActivityKind::Parallel(ParallelState {
                handle: StdMutex::new(None),
                mutex: StdMutex::new(()),
                cond: Condvar::new(),
                pending_trigger: AtomicI64::new(0),
            }),
        })
    }

    pub fn id(&self) -> ActivityId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_periodic(&self) -> bool {
        self.policy.is_periodic()
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub fn engines(&self) -> &[Arc<ExecutionEngine>] {
        &self.engines
    }

    /// Runs `init` once on every engine. Shared by both kinds' entry
    /// procedures (§4.F steps common to sequential and parallel).
    fn init_engines(&self) {
        for engine in &self.engines {
            if let Err(err) = engine.init() {
                warn!(activity = %self.id, error = %err, "engine init failed");
            }
        }
    }

    fn finalize_engines(&self) {
        for engine in &self.engines {
            if let Err(err) = engine.finalize() {
                warn!(activity = %self.id, error = %err, "engine finalize failed");
            }
        }
    }

    fn step_engines(&self) {
        for engine in &self.engines {
            if let Err(err) = engine.step() {
                warn!(activity = %self.id, error = %err, "engine step failed");
            }
        }
    }

    /// Starts this activity. `Sequential` runs its entry loop inline,
    /// blocking the caller until `stop()`; `Parallel` spawns an owned
    /// thread and returns immediately (§4.F).
    pub fn start(self: &Arc<Self>) -> Result<(), KernelError> {
        self.active.store(true, Ordering::SeqCst);
        match &self.kind {
            ActivityKind::Sequential => {
                self.init_engines();
                self.sequential_loop();
                self.active.store(false, Ordering::SeqCst);
                self.finalize_engines();
                Ok(())
            }
            ActivityKind::Parallel(state) => {
                let this = self.clone();
                let builder = std::thread::Builder::new().name(format!("{}", self.id));
                let join = builder.spawn(move || this.parallel_entry())?;
                *state.handle.lock().unwrap() = Some(join);
                Ok(())
            }
        }
    }

    fn sequential_loop(&self) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match self.policy.scheduling {
                SchedulingKind::Periodic => {
                    let period = Duration::from_millis(self.policy.period_ms.unwrap_or(0));
                    let next_start = Instant::now() + period;
                    self.step_engines();
                    let now = Instant::now();
                    if next_start > now {
                        std::thread::sleep(next_start - now);
                    }
                }
                SchedulingKind::Triggered => {
                    // No true wait on the caller's own thread; a sequential
                    // triggered activity is expected to be periodic in
                    // practice (§4.F).
                    self.step_engines();
                }
            }
        }
    }

    fn parallel_entry(self: Arc<Self>) {
        apply_scheduling_hints(&self.policy, &self.id);
        self.init_engines();
        match &self.kind {
            ActivityKind::Parallel(state) => match self.policy.scheduling {
                SchedulingKind::Periodic => self.parallel_periodic_loop(state),
                SchedulingKind::Triggered => self.parallel_triggered_loop(state),
            },
            ActivityKind::Sequential => unreachable!("parallel_entry on a sequential activity"),
        }
        self.active.store(false, Ordering::SeqCst);
        self.finalize_engines();
    }

    fn parallel_periodic_loop(&self, state: &ParallelState) {
        let period = Duration::from_millis(self.policy.period_ms.unwrap_or(0));
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let t0 = Instant::now();
            self.step_engines();
            let elapsed = t0.elapsed();
            if elapsed < period {
                let sleep_for = period - elapsed;
                let guard = state.mutex.lock().unwrap();
                let _ = state.cond.wait_timeout(guard, sleep_for).unwrap();
            }
            // Non-positive remainder: no throttling, loop immediately.
        }
    }

    fn parallel_triggered_loop(&self, state: &ParallelState) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            if state.pending_trigger.load(Ordering::SeqCst) <= 0 {
                let guard = state.mutex.lock().unwrap();
                if state.pending_trigger.load(Ordering::SeqCst) <= 0 && !self.stopping.load(Ordering::SeqCst) {
                    let _ = state.cond.wait(guard).unwrap();
                }
                continue;
            }
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            state.pending_trigger.fetch_sub(1, Ordering::SeqCst);
            self.step_engines();
        }
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let ActivityKind::Parallel(state) = &self.kind {
            let _guard = state.mutex.lock().unwrap();
            state.cond.notify_all();
        }
    }

    pub fn join(&self) {
        if let ActivityKind::Parallel(state) = &self.kind {
            let handle = state.handle.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }

    /// No-op on a periodic activity (§8 boundary behavior). Increments
    /// `pending_trigger` on a triggered one and wakes its condvar.
    pub fn trigger(&self) {
        if !matches!(self.policy.scheduling, SchedulingKind::Triggered) {
            return;
        }
        if let ActivityKind::Parallel(state) = &self.kind {
            let _guard = state.mutex.lock().unwrap();
            state.pending_trigger.fetch_add(1, Ordering::SeqCst);
            state.cond.notify_all();
        }
    }

    pub fn remove_trigger(&self) {
        if let ActivityKind::Parallel(state) = &self.kind {
            let _ = state
                .pending_trigger
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| if v > 0 { Some(v - 1) } else { Some(v) });
        }
    }

    pub fn pending_trigger(&self) -> i64 {
        match &self.kind {
            ActivityKind::Parallel(state) => state.pending_trigger.load(Ordering::SeqCst),
            ActivityKind::Sequential => 0,
        }
    }
}

/// Best-effort CPU affinity and realtime scheduling class, applied once on
/// entry to a parallel activity's thread (§4.F step 1, §9 "best-effort").
fn apply_scheduling_hints(policy: &SchedulePolicy, id: &ActivityId) {
    let cores: Vec<usize> = match policy.affinity {
        Some(core) if policy.available_core_id.contains(&core) => vec![core],
        _ => policy.available_core_id.iter().copied().collect(),
    };
    if !cores.is_empty() {
        apply_affinity(&cores, id);
    }
    if policy.realtime != RealtimeClass::None {
        apply_realtime_class(policy, id);
    }
}

#[cfg(target_os = "linux")]
fn apply_affinity(cores: &[usize], id: &ActivityId) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &core in cores {
            libc::CPU_SET(core, &mut set);
        }
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            debug!(activity = %id, "sched_setaffinity failed, continuing without pinning");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(cores: &[usize], id: &ActivityId) {
    if let Some(&core) = cores.first() {
        if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
            return;
        }
    }
    debug!(activity = %id, "CPU affinity unsupported on this platform, continuing without pinning");
}

#[cfg(target_os = "linux")]
fn apply_realtime_class(policy: &SchedulePolicy, id: &ActivityId) {
    let sched = match policy.realtime {
        RealtimeClass::Fifo => libc::SCHED_FIFO,
        RealtimeClass::Rr => libc::SCHED_RR,
        // No native SCHED_DEADLINE binding in `libc`; fall back silently.
        RealtimeClass::Deadline | RealtimeClass::None => {
            debug!(activity = %id, "realtime class unsupported by this binding, continuing at normal scheduling");
            return;
        }
    };
    unsafe {
        let param = libc::sched_param {
            sched_priority: policy.priority,
        };
        let rc = libc::sched_setscheduler(0, sched, &param);
        if rc != 0 {
            debug!(activity = %id, "sched_setscheduler failed (likely missing CAP_SYS_NICE), continuing at normal scheduling");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_realtime_class(_policy: &SchedulePolicy, id: &ActivityId) {
    debug!(activity = %id, "realtime scheduling classes unsupported on this platform, continuing at normal scheduling");
}

/// Checks every activity's `exclusive_affinity` claim against the machine's
/// actual core ids and against each other, before any activity starts
/// (§6 "affinity conflict" exit code, §7 `AffinityError`). Must run before
/// `compute_available_cores`, which otherwise silently drops invalid ids
/// via set difference.
pub fn validate_exclusive_claims(exclusive_claims: &[usize]) -> Result<(), AffinityError> {
    let valid: HashSet<usize> = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .map(|c| c.id)
        .collect();
    let mut seen = HashSet::new();
    for &core in exclusive_claims {
        if !valid.contains(&core) {
            return Err(AffinityError::OutOfRange(core));
        }
        if !seen.insert(core) {
            return Err(AffinityError::AlreadyClaimed(core));
        }
    }
    Ok(())
}

/// Computes, for a set of activities about to start, the cores not
/// exclusively claimed by any of them (§4.F "global bookkeeping"). Assumes
/// `exclusive_claims` has already passed `validate_exclusive_claims`.
pub fn compute_available_cores(exclusive_claims: &[usize]) -> HashSet<usize> {
    let all: HashSet<usize> = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .map(|c| c.id)
        .collect();
    let claimed: HashSet<usize> = exclusive_claims.iter().copied().collect();
    all.difference(&claimed).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_exclusive_claims_rejects_out_of_range_core() {
        let result = validate_exclusive_claims(&[usize::MAX]);
        assert!(matches!(result, Err(AffinityError::OutOfRange(core)) if core == usize::MAX));
    }

    #[test]
    fn validate_exclusive_claims_rejects_duplicate_claim() {
        let Some(core) = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().next()) else {
            return;
        };
        let result = validate_exclusive_claims(&[core.id, core.id]);
        assert!(matches!(result, Err(AffinityError::AlreadyClaimed(c)) if c == core.id));
    }

    #[test]
    fn trigger_on_periodic_activity_is_noop() {
        let engines = Vec::new();
        let a = Activity::new_parallel(ActivityId(0), SchedulePolicy::periodic(10), engines);
        a.trigger();
        assert_eq!(a.pending_trigger(), 0);
    }

    #[test]
    fn trigger_and_remove_trigger_on_triggered_activity() {
        let engines = Vec::new();
        let a = Activity::new_parallel(ActivityId(1), SchedulePolicy::triggered(), engines);
        a.trigger();
        a.trigger();
        assert_eq!(a.pending_trigger(), 2);
        a.remove_trigger();
        assert_eq!(a.pending_trigger(), 1);
        a.remove_trigger();
        a.remove_trigger();
        assert_eq!(a.pending_trigger(), 0);
    }
}
