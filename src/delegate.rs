//! Orchestration delegates and the two graph-building strategies.

use crate::{
    device::DeviceEnv,
    graph::{GraphApi, GraphBuilder, GraphError},
    runtime::Runtime,
    types::{CoreType, DeviceAddr, FuncId, TaskId},
};
use derive_more::Debug;
use std::sync::Arc;
use tracing::warn;

/// A resolved delegate entry point.
///
/// Receives the capability table and returns once every task it intends to
/// create is published. Any error aborts the run.
pub type DelegateFn = Arc<dyn Fn(&mut BuildApi<'_>) -> Result<(), GraphError> + Send + Sync>;

/// Host-side graph construction routine. Receives the marshalled
/// orchestration arguments.
pub type HostBuildFn<'f> =
    Box<dyn FnOnce(&mut GraphBuilder<'_>, &[u64]) -> Result<(), GraphError> + 'f>;

/// An independently compiled delegate: its image is embedded in the Runtime
/// Instance and resolved by name on the builder thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegate {
    /// Delegate image bytes.
    #[debug("{} bytes", image.len())]
    pub image: Vec<u8>,
    /// Entry-point name.
    pub entry: String,
}

impl Delegate {
    /// A delegate named `entry` with image `image`.
    pub fn new(image: impl Into<Vec<u8>>, entry: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entry: entry.into(),
        }
    }
}

/// Who builds the graph of a run.
#[derive(Debug)]
pub enum GraphSource<'f> {
    /// The host builds the graph before the launch.
    Host(#[debug("<fn>")] HostBuildFn<'f>),
    /// A delegate builds the graph on a scheduler thread.
    Delegate(Delegate),
}

impl<'f> GraphSource<'f> {
    /// Host-built graph.
    pub fn host(
        build: impl FnOnce(&mut GraphBuilder<'_>, &[u64]) -> Result<(), GraphError> + 'f,
    ) -> Self {
        Self::Host(Box::new(build))
    }

    /// Delegate-built graph.
    pub fn delegate(image: impl Into<Vec<u8>>, entry: impl Into<String>) -> Self {
        Self::Delegate(Delegate::new(image, entry))
    }
}

/// Capability table handed to a delegate: the Builder API, device-side
/// allocation and the orchestration arguments.
#[derive(Debug)]
pub struct BuildApi<'a> {
    builder: GraphBuilder<'a>,
    #[debug(skip)]
    env: &'a dyn DeviceEnv,
}

impl<'a> BuildApi<'a> {
    pub(crate) fn new(builder: GraphBuilder<'a>, env: &'a dyn DeviceEnv) -> Self {
        Self { builder, env }
    }

    pub(crate) fn into_builder(self) -> GraphBuilder<'a> {
        self.builder
    }

    fn check_running(&self) -> Result<(), GraphError> {
        if self.env.cancelled() || self.builder.runtime().is_aborted() {
            return Err(GraphError::Aborted);
        }
        Ok(())
    }

    /// Orchestration arguments prepared by the host.
    #[must_use]
    pub fn orch_args(&self) -> &'a [u64] {
        self.builder.runtime().orch_args()
    }

    /// The Runtime Instance being built.
    #[must_use]
    pub fn runtime(&self) -> &'a Runtime {
        self.builder.runtime()
    }

    /// Allocate device memory. The allocation is released by the host after
    /// the run.
    ///
    /// # Errors
    /// [`GraphError::DeviceAlloc`] if the device is out of memory or the
    /// allocation table of the Runtime Instance is full.
    pub fn device_malloc(&mut self, size: usize) -> Result<DeviceAddr, GraphError> {
        let runtime = self.builder.runtime();
        if runtime.delegate_alloc_full() {
            warn!(size, "delegate allocation table is full");
            return Err(GraphError::DeviceAlloc { size });
        }
        let addr = self
            .env
            .device_malloc(size)
            .map_err(|err| {
                warn!(%err, size, "delegate allocation failed");
                GraphError::DeviceAlloc { size }
            })?;
        let recorded = runtime.record_delegate_alloc(addr, size);
        debug_assert!(recorded, "BuildApi::device_malloc: [1]");
        Ok(addr)
    }
}

impl GraphApi for BuildApi<'_> {
    fn add_task(
        &mut self,
        args: &[u64],
        func_id: FuncId,
        core_type: CoreType,
        flags: u32,
    ) -> Result<TaskId, GraphError> {
        self.check_running()?;
        self.builder.add_task(args, func_id, core_type, flags)
    }

    fn add_successor_conditional(
        &mut self,
        predecessor: TaskId,
        successor: TaskId,
    ) -> Result<(), GraphError> {
        self.builder
            .add_successor_conditional(predecessor, successor)
    }

    fn publish_task(&mut self, task: TaskId) -> Result<(), GraphError> {
        self.check_running()?;
        self.builder.publish_task(task)
    }
}
