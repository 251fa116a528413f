//! Platform capacities.
//!
//! Every fixed-size array in the shared [`Runtime`](crate::runtime::Runtime)
//! layout is sized from these constants, so they are part of the binary
//! contract between host and device and must be identical on both sides of
//! one build. Under the `loom` feature they shrink so model checking stays
//! tractable.

/// Maximum number of blocks. One block is one cube core plus two vector
/// cores.
#[cfg(not(feature = "loom"))]
pub const MAX_BLOCKDIM: usize = 24;
#[cfg(feature = "loom")]
pub const MAX_BLOCKDIM: usize = 1;

/// Cube (AIC) cores per block.
pub const AIC_CORES_PER_BLOCKDIM: usize = 1;
/// Vector (AIV) cores per block.
pub const AIV_CORES_PER_BLOCKDIM: usize = 2;
/// Compute cores per block.
pub const CORES_PER_BLOCKDIM: usize = AIC_CORES_PER_BLOCKDIM + AIV_CORES_PER_BLOCKDIM;
/// Maximum number of compute cores.
pub const MAX_CORES: usize = MAX_BLOCKDIM * CORES_PER_BLOCKDIM;

/// Maximum number of scheduler threads, including the builder thread when a
/// delegate builds the graph.
#[cfg(not(feature = "loom"))]
pub const MAX_SCHEDULER_THREADS: usize = 4;
#[cfg(feature = "loom")]
pub const MAX_SCHEDULER_THREADS: usize = 2;

/// Graph Store capacity.
#[cfg(not(feature = "loom"))]
pub const MAX_TASKS: usize = 1024;
#[cfg(feature = "loom")]
pub const MAX_TASKS: usize = 4;

/// Arguments per task.
#[cfg(not(feature = "loom"))]
pub const MAX_TASK_ARGS: usize = 16;
#[cfg(feature = "loom")]
pub const MAX_TASK_ARGS: usize = 2;

/// Outgoing edges per task.
#[cfg(not(feature = "loom"))]
pub const MAX_FANOUT: usize = 64;
#[cfg(feature = "loom")]
pub const MAX_FANOUT: usize = 3;

/// Size of the function-address table. Valid function ids are
/// `0..MAX_FUNC_ID`.
#[cfg(not(feature = "loom"))]
pub const MAX_FUNC_ID: usize = 64;
#[cfg(feature = "loom")]
pub const MAX_FUNC_ID: usize = 2;

/// Marshalled orchestration arguments.
#[cfg(not(feature = "loom"))]
pub const MAX_ORCH_ARGS: usize = 64;
#[cfg(feature = "loom")]
pub const MAX_ORCH_ARGS: usize = 2;

/// Bytes reserved for an embedded delegate image.
#[cfg(not(feature = "loom"))]
pub const MAX_DELEGATE_IMAGE: usize = 64 * 1024;
#[cfg(feature = "loom")]
pub const MAX_DELEGATE_IMAGE: usize = 8;

/// Bytes reserved for the delegate entry-point name, including the
/// terminating NUL.
pub const DELEGATE_ENTRY_LEN: usize = 64;

/// Device allocations a delegate may record during one build.
#[cfg(not(feature = "loom"))]
pub const MAX_DELEGATE_ALLOCS: usize = 64;
#[cfg(feature = "loom")]
pub const MAX_DELEGATE_ALLOCS: usize = 2;

const _: () = assert!(MAX_TASKS < u32::MAX as usize, "task ids are stored as u32");
const _: () = assert!(MAX_FANOUT < u32::MAX as usize - 1);
