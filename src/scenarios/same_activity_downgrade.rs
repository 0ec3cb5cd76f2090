//! Scenario: two components placed on the same activity get their
//! connecting channel downgraded to `Unsync` at load time, even when the
//! connection is user-declared rather than pipeline/farm auto-wiring
//! (§8 scenario 6, §4.A "cross-activity optimization").

use std::sync::Arc;

use crate::channel::{ConnectionPolicy, LockPolicy};
use crate::component::{Component, ComponentCallbacks, NoopCallbacks};
use crate::error::KernelError;
use crate::graph::{
    ActivityKindSpec, ActivitySpec, ComponentRegistry, ComponentSpec, ConnectionSpec, GraphLoader, GraphSpec,
    SchedulePolicySpec, SchedulingKindSpec,
};
use crate::ids::ComponentId;
use crate::port::{ErasedPort, InputPort, OutputPort};

struct EchoRegistry;

impl ComponentRegistry for EchoRegistry {
    fn create(&self, class_name: &str, instance_name: &str) -> Result<Arc<Component>, KernelError> {
        let component = Component::new(
            ComponentId::new(class_name, instance_name),
            Box::new(NoopCallbacks) as Box<dyn ComponentCallbacks>,
            false,
        );
        match class_name {
            "Source" => {
                component
                    .add_port(Box::new(OutputPort::<i32>::new("out", component.id().clone(), false)))
                    .unwrap();
            }
            "Sink" => {
                component
                    .add_port(Box::new(InputPort::<i32>::new("in", component.id().clone(), false)))
                    .unwrap();
            }
            _ => unreachable!("test registry only knows Source/Sink"),
        }
        Ok(component)
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
        2
    }

    fn num_config_completed(&self) -> usize {
        2
    }
}

fn spec() -> GraphSpec {
    GraphSpec {
        name: "downgrade-demo".into(),
        components: vec![
            ComponentSpec {
                class_name: "Source".into(),
                instance_name: "src".into(),
                library_name: None,
                attributes: vec![],
                peers: vec![],
            },
            ComponentSpec {
                class_name: "Sink".into(),
                instance_name: "dst".into(),
                library_name: None,
                attributes: vec![],
                peers: vec![],
            },
        ],
        connections: vec![ConnectionSpec {
            src_task: "src".into(),
            src_port: "out".into(),
            dst_task: "dst".into(),
            dst_port: "in".into(),
            policy: ConnectionPolicy::data_locked(),
        }],
        activities: vec![ActivitySpec {
            name: "shared".into(),
            kind: ActivityKindSpec::Parallel,
            schedule: SchedulePolicySpec {
                scheduling: SchedulingKindSpec::Triggered,
                period_ms: None,
                realtime: None,
                priority: 0,
                runtime_ns: None,
                deadline_ns: None,
                affinity: None,
                exclusive_affinity: None,
            },
            components: vec!["src".into(), "dst".into()],
        }],
        pipelines: vec![],
        farms: vec![],
        resource_search_paths: vec![],
        profiling_enabled: false,
    }
}

#[test]
fn user_declared_connection_is_downgraded_when_both_ends_share_an_activity() {
    let registry = EchoRegistry;
    let loader = GraphLoader::new(&registry);
    let loaded = loader.load(&spec()).unwrap();

    let dst = loaded.component("dst").unwrap();
    let policy = dst.with_port("in", |p| p.channel_policies()).unwrap();
    assert_eq!(policy.len(), 1);
    assert_eq!(policy[0].locking, LockPolicy::Unsync, "same-activity connection must be downgraded");
}
