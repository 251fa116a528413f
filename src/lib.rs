//! Task-graph runtime for accelerators made of a few scheduler cores and many
//! compute cores.
//!
//! The host (or an orchestration delegate running on a scheduler core) builds
//! a dependency graph of tasks into a fixed-layout Runtime Instance, the
//! device dispatches and executes it, and a per-worker handshake proves every
//! worker reached a known state before results are read back.
//!
//! - Tasks are created, wired and published in three explicit steps. A task
//!   becomes dispatchable exactly once: when it is published and its last
//!   predecessor completed, whichever happens last.
//! - Publication is release-ordered; workers only read a task after observing
//!   it with acquire ordering, so no lock is held across host and device.
//! - In sequential build mode the whole graph is published before dispatch
//!   starts; in concurrent mode schedulers consume tasks while the delegate is
//!   still publishing.
//!
//! Key modules:
//! - `graph`: the Graph Store and the Builder API (`GraphApi`).
//! - `runtime`: the shared Runtime Instance.
//! - `coordinator`: the host-side Execution Coordinator.
//! - `exec`: device-side build, schedule and compute routines.
//! - `sim`: a simulation backend over host memory and thread pools.
//!
//! Quick start:
//! 1. Build a `sim::SimDevice` linking your compute routines (and delegates).
//! 2. `Coordinator::<SimConfig>::new(device)`, then `ensure_device_ready`,
//!    `register_function` for every function id and `load_binaries`.
//! 3. `init_runtime` with the marshalled arguments and a `GraphSource`, then
//!    `run` with a `LaunchConfig`.

/// Backend binding and launch parameters.
///
/// Exposes the `Config` trait binding the device backend at build time, the
/// `BuildMode` switch and `LaunchConfig`.
pub mod config;
/// The host-side Execution Coordinator and argument marshalling.
pub mod coordinator;
pub mod delegate;
pub mod device;
pub mod exec;
/// The Graph Store and the Builder API.
///
/// Tasks live in fixed-capacity arrays addressed by dense id so the store can
/// be copied between address spaces. Dependency counters and ready queues are
/// lock-free.
pub mod graph;
pub mod handshake;
pub mod platform;
pub mod runtime;
#[cfg(not(feature = "loom"))]
pub mod sim;
mod sync;
/// Identifiers, core types, the error taxonomy and the `SyncUnsafeCell`
/// primitive.
pub mod types;
