#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering},
    };

    use crate::types::SyncUnsafeCell;

    /// Spin/yield strategy for polling loops.
    ///
    /// Loom cannot see through `crossbeam_utils::Backoff`, so every snooze
    /// becomes an explicit yield point for the model checker.
    #[derive(Debug, Default)]
    pub(crate) struct Backoff;

    impl Backoff {
        pub(crate) fn new() -> Self {
            Self
        }

        pub(crate) fn snooze(&self) {
            loom::thread::yield_now();
        }

        pub(crate) fn reset(&self) {}
    }

    impl<T> SyncUnsafeCell<T> {
        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            self.0.with(f)
        }

        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            self.0.with_mut(f)
        }
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering},
    };
    pub(crate) use crossbeam_utils::Backoff;

    use crate::types::SyncUnsafeCell;

    impl<T> SyncUnsafeCell<T> {
        pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.0.get())
        }

        pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0.get())
        }
    }
}

pub(crate) use imp::*;
