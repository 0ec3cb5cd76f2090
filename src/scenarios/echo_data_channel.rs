//! Scenario: a DATA+LOCKED channel between a source and a sink, driven one
//! write-then-read pair at a time, must echo every value with no loss or
//! duplication (§8 scenario 1).

use crate::channel::ConnectionPolicy;
use crate::ids::ComponentId;
use crate::port::{InputPort, OutputPort};

#[test]
fn echo_delivers_every_value_in_order() {
    let mut out = OutputPort::<i32>::new("out", ComponentId::new("Source", "src"), false);
    let mut inp = InputPort::<i32>::new("in", ComponentId::new("Sink", "dst"), false);
    out.connect_to(&mut inp, ConnectionPolicy::data_locked()).unwrap();

    let mut received = Vec::new();
    for i in 0..10 {
        assert!(out.write(i));
        let (status, value) = inp.read();
        assert_eq!(status, crate::channel::ChannelStatus::NewData);
        received.push(value.unwrap());
    }

    assert_eq!(received, (0..10).collect::<Vec<_>>());
}
