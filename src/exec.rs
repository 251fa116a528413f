//! Device-side routines.
//!
//! A backend runs these on its scheduler and compute cores against the
//! Runtime Instance it was handed by [`Device::launch`](crate::device::Device::launch):
//! [`build`] once on the builder thread, [`schedule`] once per scheduler
//! thread, [`compute`] once per compute core. They only poll shared state and
//! never block.

mod build;
mod compute;
mod schedule;

pub use crate::exec::{build::build, compute::compute, schedule::schedule};
use crate::{device::Routine, runtime::Runtime};
use tracing::error;

/// Abort status of a compute routine that failed.
pub const KERNEL_FAULT_STATUS: i32 = -200;
/// Abort status of a worker that panicked.
pub const WORKER_PANIC_STATUS: i32 = -201;

/// Record that instance `instance` of `routine` died without reaching its
/// checkpoint, so that every other worker winds down.
pub fn worker_panicked(runtime: &Runtime, routine: Routine, instance: usize) {
    error!(%routine, instance, "worker panicked");
    runtime.abort(WORKER_PANIC_STATUS);
    let slot = match routine {
        Routine::Build => {
            runtime.set_build_status(WORKER_PANIC_STATUS);
            runtime.signal_build_done();
            runtime.builder_slot()
        }
        Routine::Schedule => runtime.scheduler_slot(instance),
        Routine::Compute => runtime.core_slot(instance),
    };
    slot.abort();
}
