mod marshal;

pub use crate::coordinator::marshal::{Arg, DeviceAllocation, Session};
use crate::{
    config::{BuildMode, Config, LaunchConfig},
    delegate::GraphSource,
    device::{Device, DeviceError, Routine},
    graph::{GraphError, TaskSummary},
    platform::{MAX_FUNC_ID, MAX_ORCH_ARGS},
    runtime::{Runtime, WorkerSummary},
    types::{DeviceAddr, ErrorKind, FuncId, HashSet, IndexMap},
};
use core::time::Duration;
use derive_more::{Debug, Display};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by the [`Coordinator`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The Builder API rejected the host-side build.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The device backend failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The operation is not allowed in the current coordinator state.
    #[error("`{operation}` is not allowed in state {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// Current state.
        state: CoordinatorState,
    },
    /// The function id is outside the function-address table.
    #[error("function id {func_id} is out of range (limit {})", MAX_FUNC_ID)]
    FuncIdOutOfRange {
        /// Offending id.
        func_id: FuncId,
    },
    /// Function registration happens before the first run only.
    #[error("function registration is closed")]
    RegistrationClosed,
    /// No routine is registered for the function id.
    #[error("function {func_id} is not registered")]
    UnregisteredFunction {
        /// Offending id.
        func_id: FuncId,
    },
    /// Too many orchestration arguments.
    #[error("{count} orchestration arguments exceed the limit of {limit}")]
    OrchArgCapacity {
        /// Supplied arguments.
        count: usize,
        /// Limit.
        limit: usize,
    },
    /// The delegate image does not fit the Runtime Instance.
    #[error("delegate image of {size} bytes exceeds {limit} bytes")]
    DelegateTooLarge {
        /// Image size.
        size: usize,
        /// Limit.
        limit: usize,
    },
    /// The delegate entry name is empty or does not fit.
    #[error("delegate entry name of {len} bytes is outside 1..={limit}")]
    DelegateEntryTooLong {
        /// Name length.
        len: usize,
        /// Limit.
        limit: usize,
    },
    /// Launch parameters the platform cannot host.
    #[error("invalid launch: {reason}")]
    InvalidLaunch {
        /// What is wrong.
        reason: &'static str,
    },
    /// The delegate build failed on the device.
    #[error("delegate build failed with status {status}")]
    DelegateFailed {
        /// Status reported by the builder thread.
        status: i32,
    },
    /// A worker aborted the run.
    #[error("execution aborted with status {status}")]
    ExecutionAborted {
        /// First abort status.
        status: i32,
    },
    /// Streams did not drain within the wait bound.
    #[error("streams did not complete within {bound:?}")]
    StreamTimeout {
        /// Wait bound.
        bound: Duration,
    },
    /// Workers did not all reach a terminal checkpoint. Outputs were not
    /// copied back.
    #[error("{incomplete} workers did not reach their checkpoint")]
    HandshakeTimeout {
        /// Workers still not started or running.
        incomplete: usize,
    },
}

impl RuntimeError {
    /// Taxonomy bucket.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Graph(err) => err.kind(),
            Self::Device(err) => err.kind(),
            Self::OrchArgCapacity { .. } => ErrorKind::Capacity,
            Self::InvalidState { .. } | Self::RegistrationClosed => ErrorKind::Ordering,
            Self::FuncIdOutOfRange { .. }
            | Self::UnregisteredFunction { .. }
            | Self::DelegateTooLarge { .. }
            | Self::DelegateEntryTooLong { .. }
            | Self::InvalidLaunch { .. } => ErrorKind::Configuration,
            Self::DelegateFailed { .. } | Self::ExecutionAborted { .. } => ErrorKind::Resource,
            Self::StreamTimeout { .. } | Self::HandshakeTimeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Coordinator lifecycle.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    /// No device selected.
    #[display("uninitialized")]
    Uninitialized,
    /// Device selected; functions may be registered.
    #[display("device-ready")]
    DeviceReady,
    /// Scheduler and compute binaries are on the device.
    #[display("binaries-loaded")]
    BinariesLoaded,
    /// A run is in flight.
    #[display("executing")]
    Executing,
    /// The last run completed.
    #[display("complete")]
    Complete,
    /// The last run failed.
    #[display("failed")]
    Failed,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Build mode the run used.
    pub build_mode: BuildMode,
    /// Tasks published by the build.
    pub published: u32,
    /// Tasks handed to compute cores.
    pub dispatched: u32,
    /// Tasks completed.
    pub completed: u32,
    /// Post-run state of every task, by id.
    pub tasks: Vec<TaskSummary>,
    /// Final checkpoint of every worker.
    pub workers: Vec<WorkerSummary>,
}

/// Host-side Execution Coordinator.
///
/// Owns the device handle and everything loaded onto it. Runs are sequenced
/// as `init_runtime` then `run`; the coordinator never hides global state, so
/// every operation goes through this handle.
#[must_use]
#[derive(Debug)]
pub struct Coordinator<C: Config> {
    #[debug(skip)]
    device: C::Device,
    state: CoordinatorState,
    device_id: Option<u32>,
    binaries: Vec<DeviceAllocation>,
    kernels: IndexMap<FuncId, DeviceAddr>,
    /// Set when a timed-out launch could not be drained: device memory may
    /// still be in use and no further run is attempted.
    wedged: bool,
}

impl<C: Config> Coordinator<C> {
    /// Coordinator over `device`, in state `uninitialized`.
    pub fn new(device: C::Device) -> Self {
        Self {
            device,
            state: CoordinatorState::Uninitialized,
            device_id: None,
            binaries: vec![],
            kernels: IndexMap::default(),
            wedged: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// The device backend.
    #[must_use]
    pub fn device(&self) -> &C::Device {
        &self.device
    }

    fn invalid_state(&self, operation: &'static str) -> RuntimeError {
        RuntimeError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Select the device and create its contexts. Idempotent.
    ///
    /// # Errors
    /// Device failure, or a different `device_id` than the one selected.
    pub fn ensure_device_ready(&mut self, device_id: u32) -> Result<(), RuntimeError> {
        match (self.state, self.device_id) {
            (CoordinatorState::Uninitialized, _) => {
                self.device.set_device(device_id)?;
                self.device_id = Some(device_id);
                self.state = CoordinatorState::DeviceReady;
                info!(device_id, "device ready");
                Ok(())
            }
            (_, Some(current)) if current == device_id => Ok(()),
            _ => Err(self.invalid_state("ensure_device_ready")),
        }
    }

    /// Copy the scheduler and compute-core binaries to the device.
    ///
    /// # Errors
    /// Not in `device-ready`, or a device failure, which fails the
    /// coordinator.
    pub fn load_binaries(&mut self, scheduler: &[u8], compute: &[u8]) -> Result<(), RuntimeError> {
        if self.state != CoordinatorState::DeviceReady {
            return Err(self.invalid_state("load_binaries"));
        }
        for image in [scheduler, compute] {
            if let Err(err) = self.load_image(image) {
                self.state = CoordinatorState::Failed;
                self.free_binaries();
                return Err(err);
            }
        }
        self.state = CoordinatorState::BinariesLoaded;
        info!(
            scheduler = scheduler.len(),
            compute = compute.len(),
            "binaries loaded"
        );
        Ok(())
    }

    fn load_image(&mut self, image: &[u8]) -> Result<(), RuntimeError> {
        let addr = self.device.allocate(image.len())?;
        self.binaries.push(DeviceAllocation {
            addr,
            size: image.len(),
        });
        self.device.copy_to_device(addr, image)?;
        Ok(())
    }

    fn free_binaries(&mut self) {
        for alloc in self.binaries.drain(..) {
            if let Err(err) = self.device.free(alloc.addr) {
                warn!(%err, addr = alloc.addr, "failed to free binary");
            }
        }
    }

    /// Place the compute routine of `func_id` on the device. Registering an id
    /// again replaces its routine.
    ///
    /// # Errors
    /// [`RuntimeError::FuncIdOutOfRange`], [`RuntimeError::RegistrationClosed`]
    /// once a run started, or a device failure.
    pub fn register_function(&mut self, func_id: FuncId, image: &[u8]) -> Result<(), RuntimeError> {
        if func_id as usize >= MAX_FUNC_ID {
            return Err(RuntimeError::FuncIdOutOfRange { func_id });
        }
        match self.state {
            CoordinatorState::DeviceReady | CoordinatorState::BinariesLoaded => {}
            CoordinatorState::Uninitialized => return Err(self.invalid_state("register_function")),
            _ => return Err(RuntimeError::RegistrationClosed),
        }
        let addr = self.device.load_kernel(func_id, image)?;
        if let Some(old) = self.kernels.insert(func_id, addr) {
            if let Err(err) = self.device.free(old) {
                warn!(%err, func_id, "failed to free replaced kernel");
            }
        }
        debug!(func_id, addr, size = image.len(), "function registered");
        Ok(())
    }

    /// Device address of the routine registered for `func_id`.
    ///
    /// # Errors
    /// [`RuntimeError::UnregisteredFunction`].
    pub fn function_addr(&self, func_id: FuncId) -> Result<DeviceAddr, RuntimeError> {
        self.kernels
            .get(&func_id)
            .copied()
            .ok_or(RuntimeError::UnregisteredFunction { func_id })
    }

    fn check_runnable(&self, operation: &'static str) -> Result<(), RuntimeError> {
        match self.state {
            CoordinatorState::BinariesLoaded
            | CoordinatorState::Complete
            | CoordinatorState::Failed
                if !self.wedged =>
            {
                Ok(())
            }
            _ => Err(self.invalid_state(operation)),
        }
    }

    /// Prepare a Runtime Instance: copy the function table, marshal `args`
    /// and either build the graph on the host or embed the delegate.
    ///
    /// # Errors
    /// Builder API errors of a host build, marshalling failures and
    /// delegate limits. Everything allocated so far is released first.
    pub fn init_runtime<'a>(
        &mut self,
        args: Vec<Arg<'a>>,
        source: GraphSource<'_>,
    ) -> Result<Session<'a>, RuntimeError> {
        self.check_runnable("init_runtime")?;
        if self.kernels.is_empty() {
            warn!("no functions registered");
        }
        let mut session = Session::new(Runtime::new_boxed());
        match self.prepare(&mut session, args, source) {
            Ok(()) => {
                info!(
                    args = session.runtime.orch_args().len(),
                    tasks = session.runtime.task_count(),
                    delegated = session.runtime.is_delegated(),
                    "runtime initialized"
                );
                Ok(session)
            }
            Err(err) => {
                self.release_session(&mut session);
                Err(err)
            }
        }
    }

    fn prepare<'a>(
        &self,
        session: &mut Session<'a>,
        args: Vec<Arg<'a>>,
        source: GraphSource<'_>,
    ) -> Result<(), RuntimeError> {
        // Rejected before any device transfer.
        if args.len() > MAX_ORCH_ARGS {
            return Err(RuntimeError::OrchArgCapacity {
                count: args.len(),
                limit: MAX_ORCH_ARGS,
            });
        }
        for (&func_id, &addr) in &self.kernels {
            session.runtime.set_function_addr(func_id, addr)?;
        }
        let orch_args = session.marshal(&self.device, args)?;
        session.runtime.set_orch_args(&orch_args)?;
        match source {
            GraphSource::Host(build) => {
                let runtime = &mut *session.runtime;
                let mut builder = runtime.builder();
                build(&mut builder, &orch_args)?;
                builder.finish()?;
                runtime.signal_build_done();
            }
            GraphSource::Delegate(delegate) => {
                session
                    .runtime
                    .set_delegate(&delegate.image, &delegate.entry)?;
            }
        }
        Ok(())
    }

    /// Execute a prepared session and finalize it.
    ///
    /// On success, outputs have been copied back into the host buffers and
    /// every device allocation of the session is released. On failure the
    /// allocations are released too, but outputs are left untouched.
    ///
    /// # Errors
    /// Invalid launch parameters, device failures, timeouts, and failures
    /// reported by the device-side routines.
    pub fn run(
        &mut self,
        mut session: Session<'_>,
        launch: &LaunchConfig,
    ) -> Result<RunReport, RuntimeError> {
        if let Err(err) = self
            .check_runnable("run")
            .and_then(|()| launch.validate())
            .and_then(|()| self.ensure_device_ready(launch.device_id))
        {
            self.release_session(&mut session);
            return Err(err);
        }
        self.state = CoordinatorState::Executing;
        info!(
            mode = %launch.build_mode,
            schedulers = launch.scheduler_threads,
            block_dim = launch.block_dim,
            "run started"
        );
        let outcome = self.execute(&mut session, launch);
        self.finalize(session, outcome)
    }

    fn execute(&mut self, session: &mut Session<'_>, launch: &LaunchConfig) -> Result<(), RuntimeError> {
        let driven = self.drive(session, launch);
        // Delegate allocations live in the device copy; read it back on every
        // exit so finalizing releases them too.
        let read_back = self.read_back(session);
        let incomplete = driven?;
        read_back?;

        let runtime = &*session.runtime;
        if incomplete != 0 {
            return Err(RuntimeError::HandshakeTimeout { incomplete });
        }
        if let Some(status) = runtime.build_status() {
            return Err(RuntimeError::DelegateFailed { status });
        }
        if let Some(status) = runtime.abort_status() {
            return Err(RuntimeError::ExecutionAborted { status });
        }
        Ok(())
    }

    /// Transfer the runtime, launch every routine, wait for the streams and
    /// poll the handshake region. Returns the number of unfinished workers.
    fn drive(&mut self, session: &mut Session<'_>, launch: &LaunchConfig) -> Result<usize, RuntimeError> {
        let runtime = &mut *session.runtime;
        let delegated = runtime.is_delegated();
        let schedulers = if delegated {
            // One thread builds, the others schedule.
            launch.scheduler_threads.saturating_sub(1).max(1)
        } else {
            launch.scheduler_threads
        };
        runtime.set_build_mode(launch.build_mode);
        runtime.init_handshakes(schedulers, launch.block_dim);
        let cores = runtime.core_count();

        let addr = self.device.allocate(size_of::<Runtime>())?;
        session.runtime_addr = Some(addr);
        self.device.copy_to_device(addr, runtime.as_bytes())?;
        session.on_device = true;

        if delegated {
            self.launch(Routine::Build, 1, addr)?;
            if launch.build_mode == BuildMode::Sequential {
                // Barrier: the whole graph is published before any dispatch.
                self.synchronize(launch.wait_bound)?;
                debug!("build phase drained");
            }
        }
        self.launch(Routine::Schedule, schedulers, addr)?;
        self.launch(Routine::Compute, cores, addr)?;
        self.synchronize(launch.wait_bound)?;

        let region = Runtime::handshake_region();
        let deadline = Instant::now() + launch.wait_bound;
        loop {
            // SAFETY: the bytes come from the device copy of this very layout.
            let bytes = unsafe { runtime.as_bytes_mut() };
            self.device
                .copy_from_device(&mut bytes[region.clone()], addr + region.start as u64)?;
            let incomplete = runtime.unfinished_workers();
            if incomplete == 0 || Instant::now() >= deadline {
                return Ok(incomplete);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Copy the runtime back from the device and collect the allocations the
    /// delegate recorded. Skipped if the runtime never reached the device or
    /// the streams may still be writing it.
    fn read_back(&mut self, session: &mut Session<'_>) -> Result<(), RuntimeError> {
        let Some(addr) = session.runtime_addr.filter(|_| session.on_device && !self.wedged) else {
            return Ok(());
        };
        let runtime = &mut *session.runtime;
        // SAFETY: the device copy was made from this layout and only mutated
        // by the device-side routines, which have all returned.
        self.device
            .copy_from_device(unsafe { runtime.as_bytes_mut() }, addr)?;
        runtime.check_layout();
        session.allocations.extend(runtime.delegate_allocations());
        Ok(())
    }

    /// Launch `routine`; on failure stop whatever was launched before it.
    fn launch(&mut self, routine: Routine, instances: usize, addr: DeviceAddr) -> Result<(), RuntimeError> {
        if let Err(err) = self.device.launch(routine, instances, addr) {
            self.stop_streams();
            return Err(err.into());
        }
        Ok(())
    }

    fn stop_streams(&mut self) {
        if !self.device.abort() {
            self.wedged = true;
        }
    }

    fn synchronize(&mut self, bound: Duration) -> Result<(), RuntimeError> {
        match self.device.synchronize(bound) {
            Ok(()) => Ok(()),
            Err(DeviceError::Timeout { bound }) => {
                self.stop_streams();
                Err(RuntimeError::StreamTimeout { bound })
            }
            Err(err) => {
                self.stop_streams();
                Err(err.into())
            }
        }
    }

    fn finalize(
        &mut self,
        mut session: Session<'_>,
        outcome: Result<(), RuntimeError>,
    ) -> Result<RunReport, RuntimeError> {
        let mut outcome = outcome;
        if outcome.is_ok() {
            for copy in &mut session.copy_back {
                if let Err(err) = self.device.copy_from_device(copy.host, copy.device) {
                    warn!(%err, addr = copy.device, "copy-back failed");
                    outcome = outcome.and(Err(err.into()));
                }
            }
        }
        self.release_session(&mut session);

        let runtime = &mut *session.runtime;
        let report = RunReport {
            build_mode: runtime.build_mode(),
            published: runtime.published_count(),
            dispatched: runtime.dispatched_count(),
            completed: runtime.completed_count(),
            workers: runtime.worker_summaries(),
            tasks: runtime.task_summaries(),
        };
        match outcome {
            Ok(()) => {
                self.state = CoordinatorState::Complete;
                info!(
                    published = report.published,
                    completed = report.completed,
                    "run complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.state = CoordinatorState::Failed;
                warn!(%err, kind = %err.kind(), "run failed");
                Err(err)
            }
        }
    }

    /// Free every device allocation of `session` exactly once. Copy-back
    /// buffers without an allocation record are freed as well.
    fn release_session(&mut self, session: &mut Session<'_>) {
        if self.wedged {
            warn!(
                allocations = session.allocations.len(),
                "device did not drain, leaking session memory"
            );
            return;
        }
        let mut freed = HashSet::default();
        let runtime_addr = session.runtime_addr.take();
        let addrs = runtime_addr
            .into_iter()
            .chain(session.allocations.drain(..).map(|alloc| alloc.addr))
            .chain(session.copy_back.drain(..).map(|copy| copy.device));
        for addr in addrs {
            if !freed.insert(addr) {
                continue;
            }
            if let Err(err) = self.device.free(addr) {
                warn!(%err, addr, "failed to free device memory");
            }
        }
    }

    /// Free kernels and binaries and tear the device down. The coordinator
    /// returns to `uninitialized`.
    pub fn release(&mut self) {
        if self.state == CoordinatorState::Uninitialized {
            return;
        }
        if !self.wedged {
            for (func_id, addr) in self.kernels.drain(..) {
                if let Err(err) = self.device.free(addr) {
                    warn!(%err, func_id, "failed to free kernel");
                }
            }
            self.free_binaries();
        }
        self.kernels.clear();
        self.binaries.clear();
        self.device.release();
        self.device_id = None;
        self.wedged = false;
        self.state = CoordinatorState::Uninitialized;
        info!("device released");
    }
}
