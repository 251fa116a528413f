//! External collaborators.
//!
//! [`Device`] is the host-side backend the coordinator drives: memory,
//! copies, kernel loading and streams. [`DeviceEnv`] is what the device-side
//! routines in [`exec`](crate::exec) see while they run on scheduler and
//! compute cores.

use crate::{
    delegate::DelegateFn,
    types::{DeviceAddr, ErrorKind, FuncId},
};
use core::time::Duration;
use derive_more::Display;
use thiserror::Error;

/// Failure reported by a device backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceError {
    /// No device was selected yet.
    #[error("device is not initialized")]
    NotReady,
    /// The allocator could not satisfy a request.
    #[error("allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested size.
        size: usize,
    },
    /// The address range is not inside one live allocation.
    #[error("address {addr:#x} (+{len}) is not a live device allocation")]
    InvalidAddress {
        /// Start address.
        addr: DeviceAddr,
        /// Length of the access.
        len: usize,
    },
    /// A transfer failed.
    #[error("copy failed: {reason}")]
    CopyFailed {
        /// Backend-specific reason.
        reason: String,
    },
    /// No compute routine is linked for this function id.
    #[error("no kernel linked for function {func_id}")]
    KernelNotLinked {
        /// Function id.
        func_id: FuncId,
    },
    /// No routine is linked at this function address.
    #[error("no kernel at address {addr:#x}")]
    UnknownKernel {
        /// Function address.
        addr: DeviceAddr,
    },
    /// A compute routine failed.
    #[error("kernel for function {func_id} faulted: {reason}")]
    KernelFault {
        /// Function id of the routine.
        func_id: FuncId,
        /// Backend-specific reason.
        reason: String,
    },
    /// No delegate is linked under this entry name.
    #[error("delegate entry `{entry}` not found")]
    DelegateNotLinked {
        /// Entry-point name.
        entry: String,
    },
    /// The stream refused a launch.
    #[error("launch of {routine} failed: {reason}")]
    Launch {
        /// Routine being launched.
        routine: Routine,
        /// Backend-specific reason.
        reason: String,
    },
    /// Streams did not drain within the wait bound.
    #[error("stream synchronization exceeded {bound:?}")]
    Timeout {
        /// Wait bound.
        bound: Duration,
    },
}

impl DeviceError {
    /// Taxonomy bucket.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::KernelNotLinked { .. } | Self::DelegateNotLinked { .. } => {
                ErrorKind::Configuration
            }
            _ => ErrorKind::Resource,
        }
    }
}

/// Device-side routine launched by the coordinator.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Routine {
    /// Runs the delegate on the builder thread. Single instance.
    #[display("build")]
    Build,
    /// Scheduler threads; instance `i` owns scheduler slot `i`.
    #[display("schedule")]
    Schedule,
    /// Compute cores; instance `i` serves core `i`.
    #[display("compute")]
    Compute,
}

/// Host-side device backend.
///
/// Methods take `&self`: a backend is shared between the coordinator and the
/// streams it launched.
pub trait Device: Send + Sync + 'static {
    /// Select `device_id` and create the contexts memory operations need.
    /// Called at most once per coordinator.
    ///
    /// # Errors
    /// Backend failure.
    fn set_device(&self, device_id: u32) -> Result<(), DeviceError>;

    /// Allocate `size` bytes of device memory.
    ///
    /// # Errors
    /// [`DeviceError::AllocationFailed`].
    fn allocate(&self, size: usize) -> Result<DeviceAddr, DeviceError>;

    /// Release an allocation made by [`Device::allocate`] or by a delegate.
    ///
    /// # Errors
    /// [`DeviceError::InvalidAddress`] for unknown addresses.
    fn free(&self, addr: DeviceAddr) -> Result<(), DeviceError>;

    /// Copy `src` to device address `dst`.
    ///
    /// # Errors
    /// Invalid range or transfer failure.
    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<(), DeviceError>;

    /// Copy `dst.len()` bytes from device address `src` to `dst`.
    ///
    /// # Errors
    /// Invalid range or transfer failure.
    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<(), DeviceError>;

    /// Place a compute routine in device memory and return its address.
    ///
    /// # Errors
    /// Allocation failure or a routine the backend cannot link.
    fn load_kernel(&self, func_id: FuncId, image: &[u8]) -> Result<DeviceAddr, DeviceError>;

    /// Start `instances` copies of `routine` against the Runtime Instance at
    /// `runtime`. Does not wait.
    ///
    /// # Errors
    /// [`DeviceError::Launch`].
    fn launch(
        &self,
        routine: Routine,
        instances: usize,
        runtime: DeviceAddr,
    ) -> Result<(), DeviceError>;

    /// Wait until every launched routine returned.
    ///
    /// # Errors
    /// [`DeviceError::Timeout`] once `bound` elapses; the streams keep running.
    fn synchronize(&self, bound: Duration) -> Result<(), DeviceError>;

    /// Cancel every launched routine and wait for the streams to drain.
    /// Returns `false` if they did not drain; device memory must then be
    /// leaked rather than freed.
    fn abort(&self) -> bool;

    /// Tear down the contexts created by [`Device::set_device`].
    fn release(&self);
}

/// What device-side routines may call while they run.
pub trait DeviceEnv: Sync {
    /// Whether the host cancelled the run. Every polling loop checks this.
    fn cancelled(&self) -> bool;

    /// Run the compute routine at `function_addr` with `args`.
    ///
    /// # Errors
    /// Unknown routine or a fault inside it.
    fn invoke(&self, function_addr: DeviceAddr, args: &[u64]) -> Result<(), DeviceError>;

    /// Allocate device memory from a device-side routine.
    ///
    /// # Errors
    /// [`DeviceError::AllocationFailed`].
    fn device_malloc(&self, size: usize) -> Result<DeviceAddr, DeviceError>;

    /// Resolve the delegate embedded as `image` under `entry`.
    ///
    /// # Errors
    /// [`DeviceError::DelegateNotLinked`].
    fn resolve_delegate(&self, image: &[u8], entry: &str) -> Result<DelegateFn, DeviceError>;
}
