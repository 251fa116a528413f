//! The Runtime Instance.
//!
//! One flat `repr(C)` value per run: written by the host, copied to device
//! memory byte for byte, mutated there by scheduler and compute cores, then
//! copied back. It holds integers and atomics only, never host pointers.

use crate::{
    config::BuildMode,
    coordinator::{DeviceAllocation, RuntimeError},
    graph::{GraphBuilder, TaskGraph, TaskSummary, TaskView},
    handshake::{Handshake, WorkerId, WorkerState},
    platform::{
        AIC_CORES_PER_BLOCKDIM, CORES_PER_BLOCKDIM, DELEGATE_ENTRY_LEN, MAX_CORES,
        MAX_DELEGATE_ALLOCS, MAX_DELEGATE_IMAGE, MAX_FUNC_ID, MAX_ORCH_ARGS,
        MAX_SCHEDULER_THREADS,
    },
    sync::{AtomicBool, AtomicI32, AtomicU32, Ordering},
    types::{CoreType, DeviceAddr, FuncId, SyncUnsafeCell, TaskId},
};
use derive_more::Debug;

const LAYOUT_MAGIC: u64 = u64::from_le_bytes(*b"TGRT\0\0v1");

/// Device allocation made by a delegate, as stored in the shared layout.
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
struct DelegateAlloc {
    addr: u64,
    size: u64,
}

/// Worker state read back by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Which worker.
    pub worker: WorkerId,
    /// Core type served, for compute cores.
    pub core_type: Option<CoreType>,
    /// Final checkpoint.
    pub state: WorkerState,
    /// Tasks executed, for compute cores.
    pub executed: u32,
}

/// The Runtime Instance shared by host, scheduler threads and compute cores.
#[derive(Debug)]
#[repr(C)]
pub struct Runtime {
    magic: u64,
    layout_size: u64,
    build_mode: u32,
    orch_argc: u32,
    /// 1 when a delegate builds the graph on its own scheduler thread.
    builder_slots: u32,
    scheduler_count: u32,
    core_count: u32,
    block_dim: u32,
    delegate_len: u32,
    delegated: u32,
    build_done: AtomicBool,
    aborted: AtomicBool,
    _reserved: [u8; 2],
    abort_status: AtomicI32,
    build_status: AtomicI32,
    delegate_alloc_count: AtomicU32,
    #[debug(skip)]
    orch_args: [u64; MAX_ORCH_ARGS],
    #[debug(skip)]
    func_addrs: [u64; MAX_FUNC_ID],
    #[debug(skip)]
    delegate_entry: [u8; DELEGATE_ENTRY_LEN],
    #[debug(skip)]
    delegate_image: [u8; MAX_DELEGATE_IMAGE],
    #[debug(skip)]
    delegate_allocs: SyncUnsafeCell<[DelegateAlloc; MAX_DELEGATE_ALLOCS]>,
    #[debug(skip)]
    scheduler_slots: [Handshake; MAX_SCHEDULER_THREADS],
    #[debug(skip)]
    core_slots: [Handshake; MAX_CORES],
    #[debug(skip)]
    pub(crate) graph: TaskGraph,
}

impl Runtime {
    /// A fresh, empty Runtime Instance on the heap.
    #[cfg(not(feature = "loom"))]
    #[must_use]
    pub fn new_boxed() -> Box<Self> {
        // SAFETY: every field is an integer, an atomic integer or bool, or an
        // array of those, so the all-zero bit pattern is a valid empty runtime.
        // Zeroing also initializes padding, which `as_bytes` relies on.
        let mut rt = unsafe { Box::<Self>::new_zeroed().assume_init() };
        rt.magic = LAYOUT_MAGIC;
        rt.layout_size = size_of::<Self>() as u64;
        rt.build_mode = BuildMode::default() as u32;
        rt
    }

    /// A fresh, empty Runtime Instance on the heap.
    #[cfg(feature = "loom")]
    #[must_use]
    pub fn new_boxed() -> Box<Self> {
        Box::new(Self {
            magic: LAYOUT_MAGIC,
            layout_size: size_of::<Self>() as u64,
            build_mode: BuildMode::default() as u32,
            orch_argc: 0,
            builder_slots: 0,
            scheduler_count: 0,
            core_count: 0,
            block_dim: 0,
            delegate_len: 0,
            delegated: 0,
            build_done: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            _reserved: [0; 2],
            abort_status: AtomicI32::new(0),
            build_status: AtomicI32::new(0),
            delegate_alloc_count: AtomicU32::new(0),
            orch_args: [0; MAX_ORCH_ARGS],
            func_addrs: [0; MAX_FUNC_ID],
            delegate_entry: [0; DELEGATE_ENTRY_LEN],
            delegate_image: [0; MAX_DELEGATE_IMAGE],
            delegate_allocs: SyncUnsafeCell::new([DelegateAlloc::default(); MAX_DELEGATE_ALLOCS]),
            scheduler_slots: core::array::from_fn(|_| Handshake::new()),
            core_slots: core::array::from_fn(|_| Handshake::new()),
            graph: TaskGraph::new(),
        })
    }

    /// Fatal unless this is an intact Runtime Instance of this build.
    pub(crate) fn check_layout(&self) {
        assert!(
            self.magic == LAYOUT_MAGIC && self.layout_size == size_of::<Self>() as u64,
            "Runtime::check_layout: [1]"
        );
    }

    // --- function table -------------------------------------------------

    /// Bind `func_id` to the device address of its compiled routine.
    ///
    /// # Errors
    /// [`RuntimeError::FuncIdOutOfRange`].
    pub fn set_function_addr(
        &mut self,
        func_id: FuncId,
        addr: DeviceAddr,
    ) -> Result<(), RuntimeError> {
        let slot = self
            .func_addrs
            .get_mut(func_id as usize)
            .ok_or(RuntimeError::FuncIdOutOfRange { func_id })?;
        *slot = addr;
        Ok(())
    }

    /// Device address registered for `func_id`, if any.
    #[must_use]
    pub fn function_addr(&self, func_id: FuncId) -> Option<DeviceAddr> {
        self.func_addrs
            .get(func_id as usize)
            .copied()
            .filter(|&addr| addr != 0)
    }

    /// Number of functions with a registered address.
    #[must_use]
    pub fn registered_functions(&self) -> usize {
        self.func_addrs.iter().filter(|&&addr| addr != 0).count()
    }

    // --- build inputs ----------------------------------------------------

    /// Host-side builder. Borrowing the runtime mutably makes it the only one.
    pub fn builder(&mut self) -> GraphBuilder<'_> {
        GraphBuilder::new(self)
    }

    /// Marshalled orchestration arguments.
    #[must_use]
    pub fn orch_args(&self) -> &[u64] {
        &self.orch_args[..self.orch_argc as usize]
    }

    pub(crate) fn set_orch_args(&mut self, args: &[u64]) -> Result<(), RuntimeError> {
        if args.len() > MAX_ORCH_ARGS {
            return Err(RuntimeError::OrchArgCapacity {
                count: args.len(),
                limit: MAX_ORCH_ARGS,
            });
        }
        self.orch_args[..args.len()].copy_from_slice(args);
        self.orch_args[args.len()..].fill(0);
        self.orch_argc = args.len() as u32;
        Ok(())
    }

    /// Build mode of this run.
    #[must_use]
    pub fn build_mode(&self) -> BuildMode {
        BuildMode::from_raw(self.build_mode)
    }

    pub(crate) fn set_build_mode(&mut self, mode: BuildMode) {
        self.build_mode = mode as u32;
    }

    /// Embed a delegate image and its entry-point name.
    pub(crate) fn set_delegate(&mut self, image: &[u8], entry: &str) -> Result<(), RuntimeError> {
        if image.len() > MAX_DELEGATE_IMAGE {
            return Err(RuntimeError::DelegateTooLarge {
                size: image.len(),
                limit: MAX_DELEGATE_IMAGE,
            });
        }
        // One byte stays NUL.
        if entry.len() >= DELEGATE_ENTRY_LEN || entry.is_empty() {
            return Err(RuntimeError::DelegateEntryTooLong {
                len: entry.len(),
                limit: DELEGATE_ENTRY_LEN - 1,
            });
        }
        self.delegate_image[..image.len()].copy_from_slice(image);
        self.delegate_image[image.len()..].fill(0);
        self.delegate_entry.fill(0);
        self.delegate_entry[..entry.len()].copy_from_slice(entry.as_bytes());
        self.delegate_len = image.len() as u32;
        self.delegated = 1;
        Ok(())
    }

    /// Whether a delegate builds the graph.
    #[must_use]
    pub fn is_delegated(&self) -> bool {
        self.delegated != 0
    }

    /// Embedded delegate image and entry name, if any.
    pub(crate) fn delegate(&self) -> Option<(&[u8], &str)> {
        if !self.is_delegated() {
            return None;
        }
        let image = &self.delegate_image[..self.delegate_len as usize];
        let len = self
            .delegate_entry
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DELEGATE_ENTRY_LEN);
        // Written from a `&str` by `set_delegate`; corruption is fatal.
        let entry = core::str::from_utf8(&self.delegate_entry[..len])
            .ok()
            .filter(|entry| !entry.is_empty());
        Some((image, entry.expect("Runtime::delegate: [1]")))
    }

    // --- handshake -------------------------------------------------------

    /// Size the handshake slots for one launch. Cores `0..block_dim` are cube
    /// cores, the rest vector cores.
    pub(crate) fn init_handshakes(&mut self, scheduler_count: usize, block_dim: usize) {
        let builder_slots = usize::from(self.is_delegated());
        assert!(
            scheduler_count >= 1 && builder_slots + scheduler_count <= MAX_SCHEDULER_THREADS,
            "Runtime::init_handshakes: [1]"
        );
        let core_count = block_dim * CORES_PER_BLOCKDIM;
        assert!(core_count <= MAX_CORES, "Runtime::init_handshakes: [2]");
        self.builder_slots = builder_slots as u32;
        self.scheduler_count = scheduler_count as u32;
        self.block_dim = block_dim as u32;
        self.core_count = core_count as u32;
        for slot in &mut self.scheduler_slots {
            slot.reset(CoreType::Aic);
        }
        let aic_cores = block_dim * AIC_CORES_PER_BLOCKDIM;
        for (idx, slot) in self.core_slots.iter_mut().enumerate() {
            let core_type = if idx < aic_cores {
                CoreType::Aic
            } else {
                CoreType::Aiv
            };
            slot.reset(core_type);
        }
    }

    /// Number of scheduler threads dispatching tasks.
    #[must_use]
    pub fn scheduler_count(&self) -> usize {
        self.scheduler_count as usize
    }

    /// Number of compute cores.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.core_count as usize
    }

    pub(crate) fn builder_slot(&self) -> &Handshake {
        assert_eq!(self.builder_slots, 1, "Runtime::builder_slot: [1]");
        &self.scheduler_slots[0]
    }

    pub(crate) fn scheduler_slot(&self, idx: usize) -> &Handshake {
        assert!(idx < self.scheduler_count(), "Runtime::scheduler_slot: [1]");
        &self.scheduler_slots[self.builder_slots as usize + idx]
    }

    pub(crate) fn core_slot(&self, idx: usize) -> &Handshake {
        assert!(idx < self.core_count(), "Runtime::core_slot: [1]");
        &self.core_slots[idx]
    }

    fn workers(&self) -> impl Iterator<Item = (WorkerId, &Handshake, bool)> {
        let schedulers = self.builder_slots as usize + self.scheduler_count();
        let sched = self.scheduler_slots[..schedulers]
            .iter()
            .enumerate()
            .map(|(idx, slot)| (WorkerId::Scheduler(idx), slot, false));
        let cores = self.core_slots[..self.core_count()]
            .iter()
            .enumerate()
            .map(|(idx, slot)| (WorkerId::Core(idx), slot, true));
        sched.chain(cores)
    }

    /// Workers that have not reached a terminal checkpoint.
    #[must_use]
    pub fn unfinished_workers(&self) -> usize {
        self.workers()
            .filter(|(_, slot, _)| {
                matches!(slot.state(), WorkerState::NotStarted | WorkerState::Running)
            })
            .count()
    }

    /// Final state of every worker of the launch.
    #[must_use]
    pub fn worker_summaries(&self) -> Vec<WorkerSummary> {
        self.workers()
            .map(|(worker, slot, is_core)| WorkerSummary {
                worker,
                core_type: is_core.then(|| slot.core_type()),
                state: slot.state(),
                executed: slot.executed(),
            })
            .collect()
    }

    /// Byte range of the handshake slots inside the layout.
    pub(crate) fn handshake_region() -> core::ops::Range<usize> {
        let start = core::mem::offset_of!(Self, scheduler_slots);
        let end = core::mem::offset_of!(Self, core_slots) + size_of::<[Handshake; MAX_CORES]>();
        start..end
    }

    // --- build / abort control ------------------------------------------

    /// Whether every task the build intends to publish is published.
    #[must_use]
    pub fn build_done(&self) -> bool {
        self.build_done.load(Ordering::Acquire)
    }

    pub(crate) fn signal_build_done(&self) {
        self.build_done.store(true, Ordering::Release);
    }

    /// Record the build outcome. Zero is success.
    pub(crate) fn set_build_status(&self, status: i32) {
        self.build_status.store(status, Ordering::Release);
    }

    /// Build outcome: `None` on success, otherwise the failure status.
    #[must_use]
    pub fn build_status(&self) -> Option<i32> {
        match self.build_status.load(Ordering::Acquire) {
            0 => None,
            status => Some(status),
        }
    }

    /// Stop the run. The first status wins.
    pub(crate) fn abort(&self, status: i32) {
        let _ = self
            .abort_status
            .compare_exchange(0, status, Ordering::AcqRel, Ordering::Acquire);
        self.aborted.store(true, Ordering::Release);
    }

    /// Whether a worker aborted the run.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Status the run was aborted with, if any.
    #[must_use]
    pub fn abort_status(&self) -> Option<i32> {
        self.is_aborted()
            .then(|| self.abort_status.load(Ordering::Acquire))
    }

    // --- delegate allocations -------------------------------------------

    pub(crate) fn delegate_alloc_full(&self) -> bool {
        self.delegate_alloc_count.load(Ordering::Relaxed) as usize >= MAX_DELEGATE_ALLOCS
    }

    /// Record a device allocation made by the delegate. Builder thread only.
    pub(crate) fn record_delegate_alloc(&self, addr: DeviceAddr, size: usize) -> bool {
        let count = self.delegate_alloc_count.load(Ordering::Relaxed) as usize;
        if count >= MAX_DELEGATE_ALLOCS {
            return false;
        }
        // SAFETY: only the builder thread writes this table and the host reads it
        // only after the streams drained.
        self.delegate_allocs.with_mut(|ptr| unsafe {
            (*ptr)[count] = DelegateAlloc {
                addr,
                size: size as u64,
            };
        });
        self.delegate_alloc_count
            .store(count as u32 + 1, Ordering::Release);
        true
    }

    /// Allocations recorded by the delegate.
    pub(crate) fn delegate_allocations(&self) -> Vec<DeviceAllocation> {
        let count = (self.delegate_alloc_count.load(Ordering::Acquire) as usize).min(MAX_DELEGATE_ALLOCS);
        // SAFETY: called by the host once the streams drained.
        let allocs = self.delegate_allocs.with(|ptr| unsafe { *ptr });
        allocs[..count]
            .iter()
            .filter(|rec| rec.addr != 0)
            .map(|rec| DeviceAllocation {
                addr: rec.addr,
                size: rec.size as usize,
            })
            .collect()
    }

    // --- graph -----------------------------------------------------------

    /// Published snapshot of `task`.
    #[must_use]
    pub fn task(&self, task: TaskId) -> Option<TaskView> {
        self.graph.view(task)
    }

    /// Tasks created so far.
    #[must_use]
    pub fn task_count(&self) -> u32 {
        self.graph.task_count()
    }

    /// Tasks published so far.
    #[must_use]
    pub fn published_count(&self) -> u32 {
        self.graph.published_count()
    }

    /// Tasks handed to compute cores so far.
    #[must_use]
    pub fn dispatched_count(&self) -> u32 {
        self.graph.dispatched_count()
    }

    /// Tasks completed so far.
    #[must_use]
    pub fn completed_count(&self) -> u32 {
        self.graph.completed_count()
    }

    /// Whether `task` has been published.
    #[must_use]
    pub fn is_published(&self, task: TaskId) -> bool {
        self.graph.is_published(task)
    }

    /// Whether `task` has completed.
    #[must_use]
    pub fn is_completed(&self, task: TaskId) -> bool {
        self.graph.is_completed(task)
    }

    /// Whether `task` is published and every predecessor has completed.
    #[must_use]
    pub fn is_dispatch_eligible(&self, task: TaskId) -> bool {
        self.graph.is_dispatch_eligible(task)
    }

    /// Take the next dispatch-ready task for `core_type`. Every task is handed
    /// out exactly once.
    pub fn pop_ready(&self, core_type: CoreType) -> Option<TaskId> {
        self.graph.pop_ready(core_type)
    }

    /// Tasks of `core_type` waiting for a core.
    #[must_use]
    pub fn ready_len(&self, core_type: CoreType) -> usize {
        self.graph.ready_len(core_type)
    }

    /// Record that `task` was handed to a compute core.
    pub fn mark_dispatched(&self, task: TaskId) {
        self.graph.mark_dispatched(task);
    }

    /// Mark a task taken from [`Runtime::pop_ready`] complete, releasing its
    /// successors.
    ///
    /// # Panics
    /// If `task` was not dispatch-eligible or already completed.
    pub fn complete_task(&self, task: TaskId) {
        self.graph.complete(task);
    }

    /// Post-run state of every created task.
    pub fn task_summaries(&mut self) -> Vec<TaskSummary> {
        self.graph.summaries()
    }

    // --- raw layout ------------------------------------------------------

    /// The layout as bytes, for copying to the device.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        // SAFETY: the runtime was allocated zeroed (padding included) and is only
        // ever written field by field or by `as_bytes_mut`, so every byte is
        // initialized.
        unsafe {
            core::slice::from_raw_parts((self as *const Self).cast::<u8>(), size_of::<Self>())
        }
    }

    /// The layout as mutable bytes, for copying back from the device.
    ///
    /// # Safety
    /// Whatever is written must be a valid Runtime Instance of this build,
    /// i.e. bytes produced by [`Runtime::as_bytes`] and mutated by the
    /// device-side routines.
    pub(crate) unsafe fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_bytes`; validity of the written bytes is on the
        // caller.
        unsafe {
            core::slice::from_raw_parts_mut((self as *mut Self).cast::<u8>(), size_of::<Self>())
        }
    }
}
