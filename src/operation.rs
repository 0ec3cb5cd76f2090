//! Named typed callables and the pending-operation queue (§3 "Operation",
//! §4.D "Operations queue").

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// A named, typed callable. Stored behind `Arc<dyn Any + Send + Sync>` in a
/// component's operation table so it can be looked up by name and later
/// downcast back to its concrete `Args`/`Ret` pair.
pub struct Operation<Args, Ret> {
    pub(crate) name: String,
    func: Box<dyn Fn(Args) -> Ret + Send + Sync>,
}

impl<Args, Ret> Operation<Args, Ret> {
    pub fn new(name: impl Into<String>, func: impl Fn(Args) -> Ret + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn call(&self, args: Args) -> Ret {
        (self.func)(args)
    }
}

pub(crate) type PendingOp = Box<dyn FnOnce() + Send>;

/// FIFO of zero-argument closures, drained one at a time during
/// `PRE_OPERATIONAL` (§4.D, §4.E). Pushes are guarded by a dedicated mutex,
/// distinct from the event-port-set mutex (§5 "shared-resource policy").
#[derive(Default)]
pub struct OperationQueue {
    pending: Mutex<VecDeque<PendingOp>>,
}

impl OperationQueue {
    pub fn push(&self, op: PendingOp) {
        self.pending.lock().push_back(op);
    }

    /// Pops and returns one pending closure, if any.
    pub fn drain_one(&self) -> Option<PendingOp> {
        self.pending.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn continuation_requeues_onto_same_queue() {
        let queue = Arc::new(OperationQueue::default());
        let op = Arc::new(Operation::new("add_one", |x: i32| x + 1));
        let result = Arc::new(AtomicI32::new(0));

        let queue_for_first = queue.clone();
        let op_clone = op.clone();
        let result_clone = result.clone();
        queue.push(Box::new(move || {
            let ret = op_clone.call(41);
            queue_for_first.push(Box::new(move || {
                result_clone.store(ret, Ordering::SeqCst);
            }));
        }));

        // First drain runs the operation and requeues the continuation.
        queue.drain_one().unwrap()();
        assert_eq!(result.load(Ordering::SeqCst), 0);
        // Second drain (a later PRE_OPERATIONAL phase) runs the continuation.
        queue.drain_one().unwrap()();
        assert_eq!(result.load(Ordering::SeqCst), 42);
    }
}
