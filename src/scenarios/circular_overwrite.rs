//! Scenario: a CIRCULAR(2) channel never rejects a write; once full it
//! overwrites the oldest entry, so reading after several un-drained writes
//! surfaces exactly the last two values pushed, oldest first (§8 scenario 3).

use crate::channel::{ChannelStatus, ConnectionPolicy, LockPolicy};
use crate::ids::ComponentId;
use crate::port::{InputPort, OutputPort};

#[test]
fn read_after_overflow_surfaces_the_last_two_writes() {
    let mut out = OutputPort::<i32>::new("out", ComponentId::new("Source", "src"), false);
    let mut inp = InputPort::<i32>::new("in", ComponentId::new("Sink", "dst"), false);
    out.connect_to(&mut inp, ConnectionPolicy::circular(2, LockPolicy::Locked)).unwrap();

    for i in 0..5 {
        assert!(out.write(i), "circular channel must never reject a write");
    }

    let (s1, v1) = inp.read();
    let (s2, v2) = inp.read();
    assert_eq!((s1, v1), (ChannelStatus::NewData, Some(3)));
    assert_eq!((s2, v2), (ChannelStatus::NewData, Some(4)));
    assert_eq!(inp.read().0, ChannelStatus::NoData);
}
