//! Resolves a declarative graph specification into instantiated components,
//! channels and activities (§4.G, §6). The XML/YAML front-end that produces
//! a `GraphSpec` is an external collaborator, out of scope here (§1); this
//! module only consumes the normalized, already-parsed tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use daggy::Dag;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activity::{self, Activity, RealtimeClass, SchedulePolicy, SchedulingKind};
use crate::channel::ConnectionPolicy;
use crate::component::Component;
use crate::engine::ExecutionEngine;
use crate::error::{ConfigError, KernelError};
use crate::ids::{ActivityId, ActivityIdAllocator, ComponentId};

/// Edge weight for the component-wiring DAG; carries enough to explain a
/// cycle error, nothing more (the DAG exists purely to reject cycles).
#[derive(Clone, Debug)]
pub struct EdgeLabel {
    pub src_port: String,
    pub dst_port: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub optional_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub class_name: String,
    pub instance_name: String,
    #[serde(default)]
    pub library_name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeSpec>,
    #[serde(default)]
    pub peers: Vec<ComponentSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub src_task: String,
    pub src_port: String,
    pub dst_task: String,
    pub dst_port: String,
    pub policy: ConnectionPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKindSpec {
    Parallel,
    Sequential,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingKindSpec {
    Periodic,
    Triggered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealtimeClassSpec {
    None,
    Fifo,
    Rr,
    Deadline,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulePolicySpec {
    pub scheduling: SchedulingKindSpec,
    #[serde(default)]
    pub period_ms: Option<u64>,
    #[serde(default)]
    pub realtime: Option<RealtimeClassSpec>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub runtime_ns: Option<u64>,
    #[serde(default)]
    pub deadline_ns: Option<u64>,
    #[serde(default)]
    pub affinity: Option<usize>,
    #[serde(default)]
    pub exclusive_affinity: Option<usize>,
}

impl SchedulePolicySpec {
    fn into_policy(self) -> SchedulePolicy {
        SchedulePolicy {
            scheduling: match self.scheduling {
                SchedulingKindSpec::Periodic => SchedulingKind::Periodic,
                SchedulingKindSpec::Triggered => SchedulingKind::Triggered,
            },
            period_ms: self.period_ms,
            realtime: match self.realtime.unwrap_or(RealtimeClassSpec::None) {
                RealtimeClassSpec::None => RealtimeClass::None,
                RealtimeClassSpec::Fifo => RealtimeClass::Fifo,
                RealtimeClassSpec::Rr => RealtimeClass::Rr,
                RealtimeClassSpec::Deadline => RealtimeClass::Deadline,
            },
            priority: self.priority,
            runtime_ns: self.runtime_ns,
            deadline_ns: self.deadline_ns,
            affinity: self.affinity,
            exclusive_affinity: self.exclusive_affinity,
            available_core_id: HashSet::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivitySpec {
    pub name: String,
    pub kind: ActivityKindSpec,
    pub schedule: SchedulePolicySpec,
    pub components: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineTaskSpec {
    pub instance_name: String,
    #[serde(default)]
    pub in_port: Option<String>,
    #[serde(default)]
    pub out_port: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub tasks: Vec<PipelineTaskSpec>,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FarmSourceSpec {
    pub component: String,
    pub out_port: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FarmGatherSpec {
    pub component: String,
    pub in_port: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FarmSpec {
    pub name: String,
    pub source: FarmSourceSpec,
    /// One already-instantiated pipeline per worker; each entry's first task
    /// receives the farm's load-balanced writes, its last task's output is
    /// wired into `gather`.
    pub workers: Vec<PipelineSpec>,
    pub gather: FarmGatherSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GraphSpec {
    pub name: String,
    pub components: Vec<ComponentSpec>,
    pub connections: Vec<ConnectionSpec>,
    pub activities: Vec<ActivitySpec>,
    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
    #[serde(default)]
    pub farms: Vec<FarmSpec>,
    #[serde(default)]
    pub resource_search_paths: Vec<String>,
    #[serde(default)]
    pub profiling_enabled: bool,
}

/// External collaborator (§6 "component registry API"): resolves class
/// names to constructed components. A library contributes factories into
/// the registry via its initializer hook; out of scope here.
pub trait ComponentRegistry: Send + Sync {
    fn create(&self, class_name: &str, instance_name: &str) -> Result<Arc<Component>, KernelError>;
    fn add_library(&self, name: &str, path: Option<&str>) -> bool;
    fn resource_finder(&self, relative_path: &str) -> Option<String>;
    fn profiling_enabled(&self) -> bool;
    fn increment_config_completed(&self);
    fn num_tasks(&self) -> usize;
    fn num_config_completed(&self) -> usize;
}

/// The fully wired, not-yet-started result of a load (§4.G steps 1-8).
pub struct LoadedGraph {
    components: HashMap<String, Arc<Component>>,
    activities: Vec<Arc<Activity>>,
    sequential: Option<Arc<Activity>>,
    dag: Dag<String, EdgeLabel>,
}

impl LoadedGraph {
    pub fn component(&self, instance_name: &str) -> Option<&Arc<Component>> {
        self.components.get(instance_name)
    }

    /// Renders the wiring DAG in Graphviz DOT form, the way the teacher's
    /// own `Dag::print_dot` does — a rendering tool (out of scope, §1) reads
    /// this; the kernel just owns the graph the DOT is derived from.
    pub fn to_dot(&self) -> String {
        format!("{}", daggy::petgraph::dot::Dot::new(&self.dag))
    }

    pub fn components(&self) -> impl Iterator<Item = &Arc<Component>> {
        self.components.values()
    }

    pub fn activities(&self) -> &[Arc<Activity>] {
        &self.activities
    }

    /// §4.G step 9: starts every parallel activity, then — at most one —
    /// sequential activity on the caller. The call blocks for the
    /// sequential case, matching `SequentialActivity::start`.
    pub fn start(&self) -> Result<(), KernelError> {
        for activity in &self.activities {
            activity.start()?;
        }
        if let Some(seq) = &self.sequential {
            seq.start()?;
        }
        Ok(())
    }

    /// Teardown: `stop()` every activity, then `join()` each (§4.G
    /// teardown). The sequential activity's `start()` already returned by
    /// the time `stop()` would matter only if it was never started from
    /// another thread; callers driving a sequential graph typically call
    /// `stop()` from a signal handler running elsewhere.
    pub fn stop(&self) {
        for activity in &self.activities {
            activity.stop();
        }
        if let Some(seq) = &self.sequential {
            seq.stop();
        }
        for activity in &self.activities {
            activity.join();
        }
    }
}

pub struct GraphLoader<'a> {
    registry: &'a dyn ComponentRegistry,
}

impl<'a> GraphLoader<'a> {
    pub fn new(registry: &'a dyn ComponentRegistry) -> Self {
        Self { registry }
    }

    pub fn load(&self, spec: &GraphSpec) -> Result<LoadedGraph, KernelError> {
        let mut components: HashMap<String, Arc<Component>> = HashMap::new();
        let mut dag: Dag<String, EdgeLabel> = Dag::new();
        let mut nodes = HashMap::new();

        // Step 1: instantiate each top-level component and apply attributes.
        let mut declaration_order = Vec::new();
        for spec in &spec.components {
            self.instantiate(spec, &mut components, &mut nodes, &mut dag, &mut declaration_order)?;
        }

        // Step 2: recursively instantiate peers (done inside `instantiate`
        // for each spec's `peers` list) and attach them to their parent.
        for spec in &spec.components {
            self.attach_peers(spec, &components)?;
        }

        // Step 3: call every component's init() in declaration order, main
        // thread, before any activity spawns.
        for name in &declaration_order {
            let component = &components[name];
            component.run_init()?;
        }

        // Step 4: create activities, attach engines, set back-pointers.
        let exclusive_claims: Vec<usize> = spec
            .activities
            .iter()
            .filter_map(|a| a.schedule.exclusive_affinity)
            .collect();
        activity::validate_exclusive_claims(&exclusive_claims)?;
        let available_cores = activity::compute_available_cores(&exclusive_claims);
        let id_alloc = ActivityIdAllocator::default();
        let mut activities = Vec::new();
        let mut sequential = None;
        let mut component_activity: HashMap<String, ActivityId> = HashMap::new();

        for activity_spec in &spec.activities {
            let mut policy = activity_spec.schedule.clone().into_policy();
            policy.available_core_id = available_cores.clone();
            let id = id_alloc.allocate();

            let mut engines = Vec::new();
            for instance_name in &activity_spec.components {
                let component = components
                    .get(instance_name)
                    .ok_or_else(|| ConfigError::UnknownInstance(instance_name.clone()))?;
                let engine = ExecutionEngine::new(component.clone(), self.registry.profiling_enabled());
                engines.push(engine);
                component_activity.insert(instance_name.clone(), id);
            }

            let activity = match activity_spec.kind {
                ActivityKindSpec::Parallel => Activity::new_parallel(id, policy, engines),
                ActivityKindSpec::Sequential => {
                    if sequential.is_some() {
                        return Err(ConfigError::MultipleSequentialActivities.into());
                    }
                    let a = Activity::new_sequential(id, policy, engines);
                    sequential = Some(a.clone());
                    a
                }
            };

            for instance_name in &activity_spec.components {
                components[instance_name].bind_activity(&activity);
            }
            if activity_spec.kind == ActivityKindSpec::Parallel {
                activities.push(activity);
            }
        }

        // Steps 5 & 6: pipelines/farms, auto-wired with the same-activity
        // downgrade applied at construction time (§4.A, resolved sequencing
        // — see design notes).
        for pipeline in &spec.pipelines {
            self.wire_pipeline(pipeline, &components, &component_activity)?;
        }
        for farm in &spec.farms {
            self.wire_farm(farm, &components, &component_activity)?;
        }

        // Step 7: user-declared connections.
        for conn in &spec.connections {
            self.wire_connection(conn, &components, &component_activity, &mut dag, &nodes)?;
        }

        // Step 8: every component must have at least one connected port.
        for (name, component) in &components {
            if !component.has_any_connected_port() {
                warn!(component = %name, "component has no connected ports");
            }
        }

        info!(graph = %spec.name, components = components.len(), "graph loaded");

        Ok(LoadedGraph {
            components,
            activities,
            sequential,
            dag,
        })
    }

    fn instantiate(
        &self,
        spec: &ComponentSpec,
        components: &mut HashMap<String, Arc<Component>>,
        nodes: &mut HashMap<String, daggy::NodeIndex>,
        dag: &mut Dag<String, EdgeLabel>,
        declaration_order: &mut Vec<String>,
    ) -> Result<(), KernelError> {
        if components.contains_key(&spec.instance_name) {
            return Err(ConfigError::DuplicateInstance(spec.instance_name.clone()).into());
        }
        if let Some(library) = &spec.library_name {
            self.registry.add_library(library, None);
        }
        let component = self.registry.create(&spec.class_name, &spec.instance_name)?;
        for attr in &spec.attributes {
            component.set_attribute_text(&attr.name, &attr.value)?;
            if attr.optional_type.as_deref() == Some("file") {
                let finder = |rel: &str| self.registry.resource_finder(rel);
                let resolved = component.with_attribute(&attr.name, |value| {
                    if let Some(file) = value.as_any_mut().downcast_mut::<crate::attribute::FileAttribute>() {
                        file.resolve_with(finder);
                        file.was_resolved()
                    } else {
                        true
                    }
                });
                if resolved == Some(false) {
                    warn!(component = %spec.instance_name, attr = %attr.name, "file attribute could not be resolved in any resource path");
                }
            }
        }
        self.registry.increment_config_completed();
        let node = dag.add_node(spec.instance_name.clone());
        nodes.insert(spec.instance_name.clone(), node);
        declaration_order.push(spec.instance_name.clone());
        components.insert(spec.instance_name.clone(), component);

        for peer in &spec.peers {
            self.instantiate(peer, components, nodes, dag, declaration_order)?;
        }
        Ok(())
    }

    fn attach_peers(&self, spec: &ComponentSpec, components: &HashMap<String, Arc<Component>>) -> Result<(), KernelError> {
        let parent = &components[&spec.instance_name];
        for peer in &spec.peers {
            let child = &components[&peer.instance_name];
            parent.add_peer(child.clone());
            self.attach_peers(peer, components)?;
        }
        Ok(())
    }

    fn effective_policy(
        &self,
        requested: ConnectionPolicy,
        src: &str,
        dst: &str,
        component_activity: &HashMap<String, ActivityId>,
    ) -> ConnectionPolicy {
        let same_activity = matches!(
            (component_activity.get(src), component_activity.get(dst)),
            (Some(a), Some(b)) if a == b
        );
        if same_activity {
            requested.downgraded_to_unsync()
        } else {
            requested
        }
    }

    fn wire_pipeline(
        &self,
        pipeline: &PipelineSpec,
        components: &HashMap<String, Arc<Component>>,
        component_activity: &HashMap<String, ActivityId>,
    ) -> Result<(), KernelError> {
        for pair in pipeline.tasks.windows(2) {
            let (upstream, downstream) = (&pair[0], &pair[1]);
            let (Some(out_port), Some(in_port)) = (&upstream.out_port, &downstream.in_port) else {
                continue;
            };
            let requested = if pipeline.parallel {
                ConnectionPolicy::data_locked()
            } else {
                ConnectionPolicy::data_unsync()
            };
            let policy = self.effective_policy(
                requested,
                &upstream.instance_name,
                &downstream.instance_name,
                component_activity,
            );
            self.connect_ports(
                components,
                &upstream.instance_name,
                out_port,
                &downstream.instance_name,
                in_port,
                policy,
            )?;
        }
        Ok(())
    }

    fn wire_farm(
        &self,
        farm: &FarmSpec,
        components: &HashMap<String, Arc<Component>>,
        component_activity: &HashMap<String, ActivityId>,
    ) -> Result<(), KernelError> {
        for worker in &farm.workers {
            self.wire_pipeline(worker, components, component_activity)?;
            if let Some(first) = worker.tasks.first() {
                if let Some(in_port) = &first.in_port {
                    let policy = self.effective_policy(
                        ConnectionPolicy::data_locked(),
                        &farm.source.component,
                        &first.instance_name,
                        component_activity,
                    );
                    self.connect_ports(
                        components,
                        &farm.source.component,
                        &farm.source.out_port,
                        &first.instance_name,
                        in_port,
                        policy,
                    )?;
                }
            }
            if let Some(last) = worker.tasks.last() {
                if let Some(out_port) = &last.out_port {
                    let policy = self.effective_policy(
                        ConnectionPolicy::data_locked(),
                        &last.instance_name,
                        &farm.gather.component,
                        component_activity,
                    );
                    self.connect_ports(
                        components,
                        &last.instance_name,
                        out_port,
                        &farm.gather.component,
                        &farm.gather.in_port,
                        policy,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn wire_connection(
        &self,
        conn: &ConnectionSpec,
        components: &HashMap<String, Arc<Component>>,
        component_activity: &HashMap<String, ActivityId>,
        dag: &mut Dag<String, EdgeLabel>,
        nodes: &HashMap<String, daggy::NodeIndex>,
    ) -> Result<(), KernelError> {
        let policy = self.effective_policy(conn.policy, &conn.src_task, &conn.dst_task, component_activity);
        self.connect_ports(components, &conn.src_task, &conn.src_port, &conn.dst_task, &conn.dst_port, policy)?;
        if let (Some(&src_node), Some(&dst_node)) = (nodes.get(&conn.src_task), nodes.get(&conn.dst_task)) {
            dag.add_edge(
                src_node,
                dst_node,
                EdgeLabel {
                    src_port: conn.src_port.clone(),
                    dst_port: conn.dst_port.clone(),
                },
            )?;
        }
        Ok(())
    }

    fn connect_ports(
        &self,
        components: &HashMap<String, Arc<Component>>,
        src_task: &str,
        src_port: &str,
        dst_task: &str,
        dst_port: &str,
        policy: ConnectionPolicy,
    ) -> Result<(), KernelError> {
        let src = components
            .get(src_task)
            .ok_or_else(|| crate::error::WiringError::PortNotFound {
                task: src_task.to_string(),
                port: src_port.to_string(),
            })?;
        let dst = components
            .get(dst_task)
            .ok_or_else(|| crate::error::WiringError::PortNotFound {
                task: dst_task.to_string(),
                port: dst_port.to_string(),
            })?;

        // Both endpoints must be borrowed mutably at once; since they're
        // different components this can't alias. `with_port` on `src`
        // returns before `dst` is touched, so take the output port out
        // momentarily isn't needed: `connect_dyn` takes `&mut dyn ErasedPort`
        // for the peer directly.
        let result = dst.with_port(dst_port, |dst_port_ref| {
            src.with_port(src_port, |src_port_ref| src_port_ref.connect_dyn(dst_port_ref, policy))
        });

        match result {
            Some(Some(r)) => r,
            Some(None) => Err(crate::error::WiringError::PortNotFound {
                task: src_task.to_string(),
                port: src_port.to_string(),
            }
            .into()),
            None => Err(crate::error::WiringError::PortNotFound {
                task: dst_task.to_string(),
                port: dst_port.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionPolicy;

    // A caller's XML/config-file parser hands us a `GraphSpec` through
    // whatever serde format it likes; round-tripping through JSON here
    // stands in for any of them.
    #[test]
    fn graph_spec_round_trips_through_json() {
        let spec = GraphSpec {
            name: "demo".into(),
            components: vec![ComponentSpec {
                class_name: "Source".into(),
                instance_name: "src".into(),
                library_name: Some("libsource.so".into()),
                attributes: vec![],
                peers: vec![],
            }],
            connections: vec![ConnectionSpec {
                src_task: "src".into(),
                src_port: "out".into(),
                dst_task: "dst".into(),
                dst_port: "in".into(),
                policy: ConnectionPolicy::data_locked(),
            }],
            activities: vec![],
            pipelines: vec![],
            farms: vec![],
            resource_search_paths: vec!["/opt/components".into()],
            profiling_enabled: true,
        };

        let json = serde_json::to_string(&spec).unwrap();
        let parsed: GraphSpec = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.name, spec.name);
        assert_eq!(parsed.components.len(), 1);
        assert_eq!(parsed.components[0].library_name.as_deref(), Some("libsource.so"));
        assert_eq!(parsed.connections[0].dst_task, "dst");
        assert!(parsed.profiling_enabled);
    }

    struct SingleSourceRegistry;

    impl ComponentRegistry for SingleSourceRegistry {
        fn create(&self, class_name: &str, instance_name: &str) -> Result<Arc<Component>, KernelError> {
            Ok(Component::new(
                ComponentId::new(class_name, instance_name),
                Box::new(crate::component::NoopCallbacks),
                false,
            ))
        }
        fn add_library(&self, _name: &str, _path: Option<&str>) -> bool {
            true
        }
        fn resource_finder(&self, _relative_path: &str) -> Option<String> {
            None
        }
        fn profiling_enabled(&self) -> bool {
            false
        }
        fn increment_config_completed(&self) {}
        fn num_tasks(&self) -> usize {
            1
        }
        fn num_config_completed(&self) -> usize {
            1
        }
    }

    #[test]
    fn to_dot_renders_every_declared_component() {
        let registry = SingleSourceRegistry;
        let loader = GraphLoader::new(&registry);
        let spec = GraphSpec {
            name: "dot-demo".into(),
            components: vec![ComponentSpec {
                class_name: "Source".into(),
                instance_name: "src".into(),
                library_name: None,
                attributes: vec![],
                peers: vec![],
            }],
            connections: vec![],
            activities: vec![],
            pipelines: vec![],
            farms: vec![],
            resource_search_paths: vec![],
            profiling_enabled: false,
        };

        let loaded = loader.load(&spec).unwrap();
        let dot = loaded.to_dot();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("src"));
    }
}
