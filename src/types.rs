use crate::sync::UnsafeCell;
use derive_more::{Deref, DerefMut, Display};
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap as _HashMap, HashSet as _HashSet};

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Sync`.
///
/// Guards the per-task meta and argument slots of a `TaskRecord` and the
/// delegate allocation table of the `Runtime`. Each is written only by the
/// single builder, before the task is published or before the allocation
/// count is bumped, and only read afterwards. Correctness is ensured by those
/// release/acquire publications, not by the type system.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(pub(crate) UnsafeCell<T>);

unsafe impl<T: Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    #[cfg(feature = "loom")]
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// Dense identifier of a task in one Graph Store.
///
/// Assigned monotonically by `add_task`, starting at zero, and never reused
/// within one Runtime Instance.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("t{_0}")]
#[repr(transparent)]
pub struct TaskId(u32);

impl TaskId {
    /// Wrap a raw identifier. The id is only meaningful once the store has
    /// handed it out.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Selects a compiled compute routine. Valid values are
/// `0..platform::MAX_FUNC_ID`.
pub type FuncId = u32;

/// A device address. Zero is never a valid address.
pub type DeviceAddr = u64;

/// Kind of compute core a task must run on.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreType {
    /// Cube (matrix) core.
    #[display("aic")]
    Aic = 0,
    /// Vector core.
    #[display("aiv")]
    Aiv = 1,
}

impl CoreType {
    /// Number of core kinds.
    pub const COUNT: usize = 2;

    pub(crate) const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Aic),
            1 => Some(Self::Aiv),
            _ => None,
        }
    }

    pub(crate) const fn raw(self) -> u8 {
        self as u8
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;

/// Failure taxonomy shared by every error type in the crate.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Graph or argument limits exceeded.
    #[display("capacity")]
    Capacity,
    /// Edge or publish referencing an invalid, out-of-range or closed task.
    #[display("ordering violation")]
    Ordering,
    /// Allocation, copy or launch failure against the device backend.
    #[display("resource")]
    Resource,
    /// Workers did not reach the expected checkpoint within the wait bound.
    #[display("timeout")]
    Timeout,
    /// Missing registration, oversized delegate, invalid launch parameters.
    #[display("configuration")]
    Configuration,
}
