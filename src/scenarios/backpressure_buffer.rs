//! Scenario: a BUFFER(2) channel between a fast source and a slow sink must
//! reject writes once full rather than block or silently drop, and every
//! value the sink does read must be one the source actually pushed, in
//! order (§8 scenario 2).

use crate::channel::LockPolicy;
use crate::ids::ComponentId;
use crate::port::{InputPort, OutputPort};

#[test]
fn reads_are_an_in_order_subsequence_of_accepted_writes() {
    let mut out = OutputPort::<i32>::new("out", ComponentId::new("Source", "src"), false);
    let mut inp = InputPort::<i32>::new("in", ComponentId::new("Sink", "dst"), false);
    out.connect_to(&mut inp, crate::channel::ConnectionPolicy::buffer(2, LockPolicy::Locked))
        .unwrap();

    let mut accepted = Vec::new();
    let mut seen = Vec::new();
    let mut next_value = 0;

    // Five source steps per one sink step, mirroring a 1ms producer against
    // a 5ms consumer.
    for _round in 0..6 {
        for _ in 0..5 {
            if out.write(next_value) {
                accepted.push(next_value);
            }
            next_value += 1;
        }
        let (status, value) = inp.read();
        if status == crate::channel::ChannelStatus::NewData {
            seen.push(value.unwrap());
        }
    }
    // Drain whatever remains.
    loop {
        let (status, value) = inp.read();
        if status != crate::channel::ChannelStatus::NewData {
            break;
        }
        seen.push(value.unwrap());
    }

    assert!(!seen.is_empty());
    assert!(accepted.len() < next_value as usize, "buffer must have rejected some writes");
    assert_eq!(seen, accepted, "every value read must match an accepted write, in order");
}
