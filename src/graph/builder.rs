use crate::{
    graph::{SEALED, TaskMeta},
    platform::{MAX_FANOUT, MAX_TASK_ARGS, MAX_TASKS},
    runtime::Runtime,
    sync::Ordering,
    types::{CoreType, ErrorKind, FuncId, TaskId},
};
use core::marker::PhantomData;
use thiserror::Error;
use tracing::debug;

/// Errors returned synchronously by the Builder API.
///
/// Every variant maps to a stable negative status code (see
/// [`GraphError::status`]) so a failure inside a delegate can travel through
/// the shared layout as a plain integer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The Graph Store is at capacity.
    #[error("graph store is full ({capacity} tasks)")]
    TaskCapacity {
        /// Store capacity.
        capacity: usize,
    },
    /// Too many arguments for one task.
    #[error("{count} arguments exceed the per-task limit of {limit}")]
    ArgCapacity {
        /// Number of arguments supplied.
        count: usize,
        /// Per-task limit.
        limit: usize,
    },
    /// The predecessor's outgoing set is full.
    #[error("task {task} already has {limit} successors")]
    FanoutCapacity {
        /// Predecessor task.
        task: TaskId,
        /// Fan-out limit.
        limit: usize,
    },
    /// `func_id` has no registered device address.
    #[error("function {func_id} has no registered device address")]
    UnknownFunction {
        /// Offending function id.
        func_id: FuncId,
    },
    /// The identifier was never handed out by this store.
    #[error("task {task} does not exist")]
    InvalidTask {
        /// Offending id.
        task: TaskId,
    },
    /// The predecessor was not created strictly before the successor.
    #[error("edge {predecessor} -> {successor} does not follow creation order")]
    OrderingViolation {
        /// Predecessor task.
        predecessor: TaskId,
        /// Successor task.
        successor: TaskId,
    },
    /// The task is already published; its predecessor set is closed.
    #[error("task {task} is already published")]
    AlreadyPublished {
        /// Offending task.
        task: TaskId,
    },
    /// A published task waits on a task that was never published.
    #[error("published task {successor} waits on unpublished task {predecessor}")]
    InertPredecessor {
        /// Unpublished predecessor.
        predecessor: TaskId,
        /// Published successor.
        successor: TaskId,
    },
    /// A delegate allocation failed.
    #[error("device allocation of {size} bytes failed")]
    DeviceAlloc {
        /// Requested size.
        size: usize,
    },
    /// The embedded delegate could not be resolved on the device.
    #[error("delegate entry `{entry}` could not be resolved")]
    DelegateUnresolved {
        /// Entry-point name.
        entry: String,
    },
    /// A delegate reported its own failure.
    #[error("delegate failed with status {status}")]
    Delegate {
        /// Delegate-defined status.
        status: i32,
    },
    /// The run was aborted while building.
    #[error("run aborted")]
    Aborted,
}

impl GraphError {
    /// Negative status code for this error.
    #[must_use]
    pub fn status(&self) -> i32 {
        match self {
            Self::TaskCapacity { .. } => -1,
            Self::ArgCapacity { .. } => -2,
            Self::FanoutCapacity { .. } => -3,
            Self::UnknownFunction { .. } => -4,
            Self::InvalidTask { .. } => -5,
            Self::OrderingViolation { .. } => -6,
            Self::AlreadyPublished { .. } => -7,
            Self::InertPredecessor { .. } => -8,
            Self::DeviceAlloc { .. } => -9,
            Self::Aborted => -10,
            Self::DelegateUnresolved { .. } => -11,
            Self::Delegate { status } if *status < 0 => *status,
            Self::Delegate { .. } => -100,
        }
    }

    /// Taxonomy bucket.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskCapacity { .. } | Self::ArgCapacity { .. } | Self::FanoutCapacity { .. } => {
                ErrorKind::Capacity
            }
            Self::InvalidTask { .. }
            | Self::OrderingViolation { .. }
            | Self::AlreadyPublished { .. }
            | Self::InertPredecessor { .. } => ErrorKind::Ordering,
            Self::UnknownFunction { .. } | Self::DelegateUnresolved { .. } => {
                ErrorKind::Configuration
            }
            Self::DeviceAlloc { .. } | Self::Delegate { .. } | Self::Aborted => ErrorKind::Resource,
        }
    }
}

/// The Builder API.
///
/// Implemented by [`GraphBuilder`] for host-side construction and by
/// [`BuildApi`](crate::delegate::BuildApi) for delegates running on a
/// scheduler core. Any error must abort the caller's build sequence.
pub trait GraphApi {
    /// Create an unpublished task and return its dense id.
    ///
    /// # Errors
    /// [`GraphError::TaskCapacity`], [`GraphError::ArgCapacity`] or
    /// [`GraphError::UnknownFunction`]; the store is left unchanged.
    fn add_task(
        &mut self,
        args: &[u64],
        func_id: FuncId,
        core_type: CoreType,
        flags: u32,
    ) -> Result<TaskId, GraphError>;

    /// Gate `successor` on the completion of `predecessor`.
    ///
    /// # Errors
    /// [`GraphError::InvalidTask`], [`GraphError::OrderingViolation`],
    /// [`GraphError::AlreadyPublished`] or [`GraphError::FanoutCapacity`]; the
    /// store is left unchanged.
    fn add_successor_conditional(
        &mut self,
        predecessor: TaskId,
        successor: TaskId,
    ) -> Result<(), GraphError>;

    /// Make `task` visible to the dispatch phase.
    ///
    /// # Errors
    /// [`GraphError::InvalidTask`] or [`GraphError::AlreadyPublished`].
    fn publish_task(&mut self, task: TaskId) -> Result<(), GraphError>;
}

/// The single writer of a Graph Store.
///
/// Not `Send`/`Sync`: exactly one builder exists per build, either on the host
/// (borrowing the Runtime Instance mutably) or on the builder thread of a
/// scheduler core.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    runtime: &'a Runtime,
    _single_writer: PhantomData<*const ()>,
}

impl<'a> GraphBuilder<'a> {
    pub(crate) fn new(runtime: &'a mut Runtime) -> Self {
        Self {
            runtime,
            _single_writer: PhantomData,
        }
    }

    /// Attach a builder to a Runtime Instance shared with running workers.
    ///
    /// # Safety
    /// No other builder may exist for `runtime` while the returned one is
    /// alive.
    #[must_use]
    pub unsafe fn attach(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            _single_writer: PhantomData,
        }
    }

    /// The Runtime Instance being built.
    #[must_use]
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    /// Close the build: reject graphs in which a published task waits on a
    /// task that will never be published.
    ///
    /// # Errors
    /// [`GraphError::InertPredecessor`] for the first such edge.
    pub fn finish(self) -> Result<(), GraphError> {
        let graph = &self.runtime.graph;
        let count = graph.task_count() as usize;
        for (idx, rec) in graph.tasks[..count].iter().enumerate() {
            if rec.is_published() {
                continue;
            }
            let recorded = rec.fanout_len.load(Ordering::Acquire);
            assert_ne!(recorded, SEALED, "GraphBuilder::finish: [1]");
            for slot in &rec.fanout[..recorded as usize] {
                let successor = TaskId::new(slot.load(Ordering::Relaxed));
                if graph.tasks[successor.index()].is_published() {
                    return Err(GraphError::InertPredecessor {
                        predecessor: TaskId::new(idx as u32),
                        successor,
                    });
                }
            }
        }
        Ok(())
    }
}

impl GraphApi for GraphBuilder<'_> {
    fn add_task(
        &mut self,
        args: &[u64],
        func_id: FuncId,
        core_type: CoreType,
        flags: u32,
    ) -> Result<TaskId, GraphError> {
        let graph = &self.runtime.graph;
        // Only this builder writes `task_count`.
        let raw_id = graph.task_count.load(Ordering::Relaxed);
        if raw_id as usize >= MAX_TASKS {
            return Err(GraphError::TaskCapacity {
                capacity: MAX_TASKS,
            });
        }
        if args.len() > MAX_TASK_ARGS {
            return Err(GraphError::ArgCapacity {
                count: args.len(),
                limit: MAX_TASK_ARGS,
            });
        }
        let function_addr = self
            .runtime
            .function_addr(func_id)
            .ok_or(GraphError::UnknownFunction { func_id })?;

        let rec = &graph.tasks[raw_id as usize];
        let meta = TaskMeta {
            function_addr,
            func_id,
            arg_count: args.len() as u32,
            flags,
            core_type: core_type.raw(),
            ..TaskMeta::default()
        };
        // SAFETY: the slot is beyond `task_count`, so no worker can reach it, and
        // this is the only builder.
        rec.meta.with_mut(|ptr| unsafe { *ptr = meta });
        rec.args.with_mut(|ptr| {
            // SAFETY: as above.
            let slots = unsafe { &mut *ptr };
            slots[..args.len()].copy_from_slice(args);
            slots[args.len()..].fill(0);
        });
        rec.pending.store(1, Ordering::Relaxed);
        rec.fanin.store(0, Ordering::Relaxed);
        rec.fanout_len.store(0, Ordering::Relaxed);
        rec.published.store(false, Ordering::Relaxed);
        rec.completed.store(false, Ordering::Relaxed);
        rec.dispatch_seq.store(0, Ordering::Relaxed);
        rec.complete_seq.store(0, Ordering::Relaxed);
        graph.task_count.store(raw_id + 1, Ordering::Release);

        let task = TaskId::new(raw_id);
        debug!(%task, func_id, %core_type, args = args.len(), "task added");
        Ok(task)
    }

    fn add_successor_conditional(
        &mut self,
        predecessor: TaskId,
        successor: TaskId,
    ) -> Result<(), GraphError> {
        let graph = &self.runtime.graph;
        let pred = graph
            .record(predecessor)
            .ok_or(GraphError::InvalidTask { task: predecessor })?;
        let succ = graph
            .record(successor)
            .ok_or(GraphError::InvalidTask { task: successor })?;
        if predecessor >= successor {
            return Err(GraphError::OrderingViolation {
                predecessor,
                successor,
            });
        }
        if succ.published.load(Ordering::Relaxed) {
            return Err(GraphError::AlreadyPublished { task: successor });
        }

        let recorded = pred.fanout_len.load(Ordering::Acquire);
        if recorded == SEALED {
            // Predecessor already completed: the edge is satisfied on arrival.
            succ.fanin.fetch_add(1, Ordering::Relaxed);
            debug!(%predecessor, %successor, "edge to completed predecessor");
            return Ok(());
        }
        if recorded as usize >= MAX_FANOUT {
            return Err(GraphError::FanoutCapacity {
                task: predecessor,
                limit: MAX_FANOUT,
            });
        }

        // `successor` still holds its publication token, so this count cannot
        // reach zero here.
        succ.pending.fetch_add(1, Ordering::Relaxed);
        pred.fanout[recorded as usize].store(successor.get(), Ordering::Relaxed);
        if let Err(actual) = pred.fanout_len.compare_exchange(
            recorded,
            recorded + 1,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            // Only completion changes the length behind our back.
            assert_eq!(actual, SEALED, "GraphBuilder::add_successor_conditional: [1]");
            succ.pending.fetch_sub(1, Ordering::Relaxed);
            debug!(%predecessor, %successor, "predecessor completed while linking");
        }
        succ.fanin.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn publish_task(&mut self, task: TaskId) -> Result<(), GraphError> {
        let graph = &self.runtime.graph;
        let rec = graph.record(task).ok_or(GraphError::InvalidTask { task })?;
        if rec.published.load(Ordering::Relaxed) {
            return Err(GraphError::AlreadyPublished { task });
        }
        rec.published.store(true, Ordering::Release);
        graph.published_count.fetch_add(1, Ordering::Release);
        graph.release_dependency(task);
        debug!(%task, "task published");
        Ok(())
    }
}
