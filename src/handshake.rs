//! Per-worker checkpoint slots.
//!
//! Every scheduler thread and every compute core owns one [`Handshake`] slot
//! in the shared Runtime layout. A slot is a small state machine
//! (`NotStarted -> Running -> Done`, or `Aborted`) with release-ordered
//! transitions, polled by the host after the streams drain. Compute-core slots
//! double as the dispatch mailbox between a scheduler thread and its core.

use crate::{
    sync::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    types::{CoreType, TaskId},
};
use derive_more::Display;

/// Checkpoint reached by one worker.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// The worker never came up.
    #[display("not-started")]
    NotStarted = 0,
    /// The worker is polling shared state.
    #[display("running")]
    Running = 1,
    /// The worker left its loop normally.
    #[display("done")]
    Done = 2,
    /// The worker left its loop because the run was aborted or cancelled.
    #[display("aborted")]
    Aborted = 3,
}

impl WorkerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Running,
            2 => Self::Done,
            _ => Self::Aborted,
        }
    }
}

/// Which kind of worker owns a slot.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WorkerId {
    /// Scheduler thread `n`.
    #[display("scheduler-{_0}")]
    Scheduler(usize),
    /// Compute core `n`.
    #[display("core-{_0}")]
    Core(usize),
}

const MAILBOX_EMPTY: u32 = 0;

/// One worker's handshake slot.
#[derive(Debug)]
#[repr(C, align(128))]
pub struct Handshake {
    state: AtomicU8,
    /// Core type served by a compute core. Written by the host before launch.
    core_type: u8,
    quit: AtomicBool,
    _reserved: u8,
    /// `task_id + 1` of the task handed to this core, zero when idle.
    mailbox: AtomicU32,
    executed: AtomicU32,
}

impl Handshake {
    #[cfg(feature = "loom")]
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            core_type: 0,
            quit: AtomicBool::new(false),
            _reserved: 0,
            mailbox: AtomicU32::new(MAILBOX_EMPTY),
            executed: AtomicU32::new(0),
        }
    }

    /// Reset the slot before launch. Host only.
    pub(crate) fn reset(&mut self, core_type: CoreType) {
        self.core_type = core_type.raw();
        self.state
            .store(WorkerState::NotStarted as u8, Ordering::Relaxed);
        self.quit.store(false, Ordering::Relaxed);
        self.mailbox.store(MAILBOX_EMPTY, Ordering::Relaxed);
        self.executed.store(0, Ordering::Relaxed);
    }

    /// Current checkpoint.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Number of tasks executed through this slot.
    #[must_use]
    pub fn executed(&self) -> u32 {
        self.executed.load(Ordering::Acquire)
    }

    pub(crate) fn core_type(&self) -> CoreType {
        CoreType::from_raw(self.core_type).expect("Handshake::core_type: [1]")
    }

    pub(crate) fn begin(&self) {
        self.state
            .store(WorkerState::Running as u8, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        self.state.store(WorkerState::Done as u8, Ordering::Release);
    }

    pub(crate) fn abort(&self) {
        self.state
            .store(WorkerState::Aborted as u8, Ordering::Release);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.mailbox.load(Ordering::Acquire) == MAILBOX_EMPTY
    }

    /// Hand `task` to the owning core. Only the scheduler that owns this core
    /// calls this, and only while the mailbox is idle.
    pub(crate) fn dispatch(&self, task: TaskId) {
        debug_assert!(self.is_idle(), "Handshake::dispatch: [1]");
        self.mailbox.store(task.get() + 1, Ordering::Release);
    }

    pub(crate) fn pending_task(&self) -> Option<TaskId> {
        match self.mailbox.load(Ordering::Acquire) {
            MAILBOX_EMPTY => None,
            raw => Some(TaskId::new(raw - 1)),
        }
    }

    /// Called by the core after the pending task completed.
    pub(crate) fn retire(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        self.mailbox.store(MAILBOX_EMPTY, Ordering::Release);
    }

    pub(crate) fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub(crate) fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }
}
