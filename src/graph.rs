mod builder;
mod ready;

pub use crate::graph::builder::{GraphApi, GraphBuilder, GraphError};
pub(crate) use crate::graph::ready::ReadyQueue;
use crate::{
    platform::{MAX_FANOUT, MAX_TASK_ARGS, MAX_TASKS},
    sync::{AtomicBool, AtomicU32, Ordering},
    types::{CoreType, DeviceAddr, FuncId, SyncUnsafeCell, TaskId},
};
use derive_more::Debug;

/// Marks the fan-out list of a completed task. Edges added afterwards are
/// satisfied immediately instead of being recorded.
const SEALED: u32 = u32::MAX;

/// Fields fixed by `add_task`. Written once by the builder before the task is
/// published, read by workers only after they observed the publication.
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub(crate) struct TaskMeta {
    pub(crate) function_addr: DeviceAddr,
    pub(crate) func_id: FuncId,
    pub(crate) arg_count: u32,
    pub(crate) flags: u32,
    pub(crate) core_type: u8,
    _reserved: [u8; 3],
}

/// One slot of the Graph Store.
///
/// Dependency protocol:
/// - `pending` starts at 1 (the publication token) and grows by one per
///   recorded incoming edge. Publishing and every completing predecessor
///   decrement it; whoever brings it to zero pushes the task to the ready
///   queue, so a task is enqueued exactly once.
/// - `fanout_len` counts recorded outgoing edges. The completing core swaps it
///   to [`SEALED`] and resolves exactly the edges it observed; the builder
///   appends with a CAS and treats a sealed list as an already satisfied edge.
#[derive(Debug)]
#[repr(C, align(64))]
pub(crate) struct TaskRecord {
    #[debug(skip)]
    meta: SyncUnsafeCell<TaskMeta>,
    #[debug(skip)]
    args: SyncUnsafeCell<[u64; MAX_TASK_ARGS]>,
    pending: AtomicU32,
    fanin: AtomicU32,
    fanout_len: AtomicU32,
    published: AtomicBool,
    completed: AtomicBool,
    _reserved: [u8; 2],
    dispatch_seq: AtomicU32,
    complete_seq: AtomicU32,
    #[debug(skip)]
    fanout: [AtomicU32; MAX_FANOUT],
}

impl TaskRecord {
    #[cfg(feature = "loom")]
    fn new() -> Self {
        Self {
            meta: SyncUnsafeCell::new(TaskMeta::default()),
            args: SyncUnsafeCell::new([0; MAX_TASK_ARGS]),
            pending: AtomicU32::new(0),
            fanin: AtomicU32::new(0),
            fanout_len: AtomicU32::new(0),
            published: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            _reserved: [0; 2],
            dispatch_seq: AtomicU32::new(0),
            complete_seq: AtomicU32::new(0),
            fanout: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// The caller must have observed this task's publication (acquire) or
    /// otherwise hold exclusive access to the store.
    unsafe fn meta(&self) -> TaskMeta {
        // SAFETY: forwarded to the caller.
        self.meta.with(|ptr| unsafe { *ptr })
    }

    /// # Safety
    ///
    /// Same contract as [`TaskRecord::meta`].
    unsafe fn args(&self) -> [u64; MAX_TASK_ARGS] {
        // SAFETY: forwarded to the caller.
        self.args.with(|ptr| unsafe { *ptr })
    }
}

/// The Graph Store: fixed-capacity task records addressed by dense id, plus
/// one ready queue per core type.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct TaskGraph {
    task_count: AtomicU32,
    published_count: AtomicU32,
    dispatched_count: AtomicU32,
    completed_count: AtomicU32,
    /// Shared sequence source for dispatch and completion events, so the two
    /// can be compared across tasks.
    clock: AtomicU32,
    _reserved: u32,
    #[debug(skip)]
    ready: [ReadyQueue; CoreType::COUNT],
    #[debug(skip)]
    tasks: [TaskRecord; MAX_TASKS],
}

/// Snapshot of a published task as seen by a worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskView {
    /// Task identifier.
    pub id: TaskId,
    /// Function identifier.
    pub func_id: FuncId,
    /// Device address of the compiled routine.
    pub function_addr: DeviceAddr,
    /// Target core type.
    pub core_type: CoreType,
    /// Opaque flags passed to `add_task`.
    pub flags: u32,
    args: [u64; MAX_TASK_ARGS],
    arg_count: u32,
}

impl TaskView {
    /// Argument list, in `add_task` order.
    #[must_use]
    pub fn args(&self) -> &[u64] {
        &self.args[..self.arg_count as usize]
    }
}

/// Post-run state of one task, read by the host after copy-back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    /// Task identifier.
    pub id: TaskId,
    /// Function identifier.
    pub func_id: FuncId,
    /// Target core type, `None` if the stored tag is corrupted.
    pub core_type: Option<CoreType>,
    /// Number of edges that gated this task.
    pub fanin: u32,
    /// Whether the task was published.
    pub published: bool,
    /// Whether the task completed.
    pub completed: bool,
    /// Position of the dispatch event on the shared event clock.
    pub dispatch_seq: Option<u32>,
    /// Position of the completion event on the shared event clock.
    pub complete_seq: Option<u32>,
}

impl TaskGraph {
    #[cfg(feature = "loom")]
    pub(crate) fn new() -> Self {
        Self {
            task_count: AtomicU32::new(0),
            published_count: AtomicU32::new(0),
            dispatched_count: AtomicU32::new(0),
            completed_count: AtomicU32::new(0),
            clock: AtomicU32::new(0),
            _reserved: 0,
            ready: core::array::from_fn(|_| ReadyQueue::new()),
            tasks: core::array::from_fn(|_| TaskRecord::new()),
        }
    }

    pub(crate) fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    pub(crate) fn published_count(&self) -> u32 {
        self.published_count.load(Ordering::Acquire)
    }

    pub(crate) fn dispatched_count(&self) -> u32 {
        self.dispatched_count.load(Ordering::Acquire)
    }

    pub(crate) fn completed_count(&self) -> u32 {
        self.completed_count.load(Ordering::Acquire)
    }

    fn record(&self, task: TaskId) -> Option<&TaskRecord> {
        (task.get() < self.task_count()).then(|| &self.tasks[task.index()])
    }

    pub(crate) fn is_published(&self, task: TaskId) -> bool {
        self.record(task).is_some_and(TaskRecord::is_published)
    }

    pub(crate) fn is_completed(&self, task: TaskId) -> bool {
        self.record(task)
            .is_some_and(|rec| rec.completed.load(Ordering::Acquire))
    }

    pub(crate) fn is_dispatch_eligible(&self, task: TaskId) -> bool {
        self.record(task).is_some_and(|rec| {
            rec.is_published() && rec.pending.load(Ordering::Acquire) == 0
        })
    }

    /// Published snapshot of `task`, or `None` if it does not exist or has not
    /// been published yet.
    pub(crate) fn view(&self, task: TaskId) -> Option<TaskView> {
        let rec = self.record(task)?;
        if !rec.is_published() {
            return None;
        }
        // SAFETY: publication was observed with acquire ordering above, and the
        // builder never writes these cells after publishing.
        let (meta, args) = unsafe { (rec.meta(), rec.args()) };
        Some(TaskView {
            id: task,
            func_id: meta.func_id,
            function_addr: meta.function_addr,
            core_type: CoreType::from_raw(meta.core_type)?,
            flags: meta.flags,
            args,
            arg_count: meta.arg_count,
        })
    }

    pub(crate) fn pop_ready(&self, core_type: CoreType) -> Option<TaskId> {
        self.ready[core_type as usize].pop()
    }

    pub(crate) fn ready_len(&self, core_type: CoreType) -> usize {
        self.ready[core_type as usize].len()
    }

    fn tick(&self) -> u32 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn mark_dispatched(&self, task: TaskId) {
        let rec = &self.tasks[task.index()];
        rec.dispatch_seq.store(self.tick(), Ordering::Relaxed);
        self.dispatched_count.fetch_add(1, Ordering::Release);
    }

    /// Mark `task` complete and release every successor recorded so far.
    ///
    /// # Panics
    /// If the task was never ready, or completes twice.
    pub(crate) fn complete(&self, task: TaskId) {
        let rec = &self.tasks[task.index()];
        assert!(
            rec.is_published() && rec.pending.load(Ordering::Acquire) == 0,
            "TaskGraph::complete: [1]"
        );
        rec.complete_seq.store(self.tick(), Ordering::Relaxed);
        rec.completed.store(true, Ordering::Release);
        let recorded = rec.fanout_len.swap(SEALED, Ordering::AcqRel);
        assert_ne!(recorded, SEALED, "TaskGraph::complete: [2]");
        for slot in &rec.fanout[..recorded as usize] {
            let successor = TaskId::new(slot.load(Ordering::Relaxed));
            self.release_dependency(successor);
        }
        self.completed_count.fetch_add(1, Ordering::Release);
    }

    /// Drop one unit of `task`'s pending count; the caller that brings it to
    /// zero enqueues the task.
    fn release_dependency(&self, task: TaskId) {
        let rec = &self.tasks[task.index()];
        if rec.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            // SAFETY: the count only reaches zero after the publication token was
            // released, and the acquire above synchronizes with that release.
            let meta = unsafe { rec.meta() };
            let core_type =
                CoreType::from_raw(meta.core_type).expect("TaskGraph::release_dependency: [1]");
            self.ready[core_type as usize].push(task);
        }
    }

    /// Summaries of every created task.
    ///
    /// Takes `&mut self`: only the host, holding the store exclusively, may read
    /// fields of unpublished tasks.
    pub(crate) fn summaries(&mut self) -> Vec<TaskSummary> {
        let count = self.task_count() as usize;
        self.tasks[..count]
            .iter()
            .enumerate()
            .map(|(idx, rec)| {
                // SAFETY: `&mut self` excludes any concurrent builder.
                let meta = unsafe { rec.meta() };
                let seq = |v: u32| (v != 0).then_some(v);
                TaskSummary {
                    id: TaskId::new(idx as u32),
                    func_id: meta.func_id,
                    core_type: CoreType::from_raw(meta.core_type),
                    fanin: rec.fanin.load(Ordering::Relaxed),
                    published: rec.published.load(Ordering::Relaxed),
                    completed: rec.completed.load(Ordering::Relaxed),
                    dispatch_seq: seq(rec.dispatch_seq.load(Ordering::Relaxed)),
                    complete_seq: seq(rec.complete_seq.load(Ordering::Relaxed)),
                }
            })
            .collect()
    }
}
