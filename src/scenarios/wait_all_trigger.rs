//! Scenario: a component with `wait_all_trigger` and two event input ports
//! only triggers its activity once every port has fired since the last
//! trigger, and a consuming read balances the count back down (§8 scenario 5,
//! §4.B "Event ports", §4.D coalescing).

use std::sync::Arc;

use crate::activity::{Activity, SchedulePolicy};
use crate::channel::ConnectionPolicy;
use crate::component::{Component, NoopCallbacks};
use crate::engine::ExecutionEngine;
use crate::ids::{ActivityId, ComponentId};
use crate::port::{ErasedPort, InputPort, OutputPort};

#[test]
fn both_event_ports_must_fire_before_the_activity_is_triggered() {
    crate::scenarios::init_tracing();

    let sink = Component::new(ComponentId::new("Sink", "sink"), Box::new(NoopCallbacks), true);
    sink.add_port(Box::new(InputPort::<i32>::new("in1", sink.id().clone(), true)))
        .unwrap();
    sink.add_port(Box::new(InputPort::<i32>::new("in2", sink.id().clone(), true)))
        .unwrap();

    let engine = ExecutionEngine::new(sink.clone(), false);
    let activity = Activity::new_parallel(ActivityId(0), SchedulePolicy::triggered(), vec![engine]);
    sink.bind_activity(&activity);

    let mut out1 = OutputPort::<i32>::new("out1", ComponentId::new("Source", "s1"), true);
    let mut out2 = OutputPort::<i32>::new("out2", ComponentId::new("Source", "s2"), true);
    sink.with_port("in1", |inp| out1.connect_dyn(inp, ConnectionPolicy::data_locked()))
        .unwrap()
        .unwrap();
    sink.with_port("in2", |inp| out2.connect_dyn(inp, ConnectionPolicy::data_locked()))
        .unwrap()
        .unwrap();

    out1.write(1);
    assert_eq!(activity.pending_trigger(), 0, "only one of two event ports fired");

    out2.write(2);
    assert_eq!(activity.pending_trigger(), 1, "both ports fired, activity must trigger once");

    // A second write to the same port, without the other firing again,
    // does not retrigger.
    out1.write(3);
    assert_eq!(activity.pending_trigger(), 1);

    read_port::<i32>(&sink, "in1");
    assert_eq!(activity.pending_trigger(), 0, "consuming read balances the trigger count");
}

fn read_port<T: Send + 'static>(component: &Arc<Component>, name: &str) {
    component.with_port(name, |p| {
        let port = p.as_any_mut().downcast_mut::<InputPort<T>>().unwrap();
        port.read();
    });
}
