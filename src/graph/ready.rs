use crate::{
    platform::MAX_TASKS,
    sync::{AtomicU32, Ordering},
    types::TaskId,
};

/// Multi-producer, multi-consumer queue of dispatch-ready tasks of one core
/// type.
///
/// Every task is pushed at most once per graph instance, so the slot array
/// never wraps: `tail` only grows and is bounded by the store capacity.
/// A slot holds `task_id + 1`; zero marks a reserved slot whose producer has
/// not finished writing yet.
#[derive(Debug)]
#[repr(C, align(128))]
pub(crate) struct ReadyQueue {
    head: AtomicU32,
    tail: AtomicU32,
    slots: [AtomicU32; MAX_TASKS],
}

impl ReadyQueue {
    #[cfg(feature = "loom")]
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            slots: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    pub(crate) fn push(&self, task: TaskId) {
        let slot = self.tail.fetch_add(1, Ordering::Relaxed) as usize;
        assert!(slot < MAX_TASKS, "ReadyQueue::push: [1]");
        self.slots[slot].store(task.get() + 1, Ordering::Release);
    }

    pub(crate) fn pop(&self) -> Option<TaskId> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head >= self.tail.load(Ordering::Acquire) {
                return None;
            }
            let raw = self.slots[head as usize].load(Ordering::Acquire);
            if raw == 0 {
                // Reserved by a producer that is still writing. Caller polls again.
                return None;
            }
            match self.head.compare_exchange_weak(
                head,
                head + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(TaskId::new(raw - 1)),
                Err(actual) => head = actual,
            }
        }
    }

    /// Number of tasks pushed but not yet popped.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }
}
