use crate::{
    coordinator::RuntimeError,
    device::Device,
    platform::{MAX_BLOCKDIM, MAX_SCHEDULER_THREADS},
};
use core::time::Duration;
use derive_more::Display;
use tracing::warn;

/// Environment variable selecting the build mode.
pub const BUILD_MODE_ENV: &str = "TGR_BUILD_MODE";
/// Environment variable overriding the wait bound, in milliseconds.
pub const WAIT_BOUND_ENV: &str = "TGR_WAIT_BOUND_MS";

/// Configuration entry-point for instantiating the coordinator.
///
/// A concrete `Config` binds the device backend at build time. Hardware and
/// simulated device memory have structurally different address spaces, so the
/// backend is never switched at runtime.
pub trait Config: Sized + 'static {
    /// Device backend driven by the coordinator.
    type Device: Device;
}

/// Whether graph construction and dispatch may overlap.
#[derive(Debug, Display, Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BuildMode {
    /// Every task is published before any scheduler starts dispatching.
    #[display("sequential")]
    Sequential = 0,
    /// Schedulers dispatch published tasks while the build is still running.
    #[default]
    #[display("concurrent")]
    Concurrent = 1,
}

impl BuildMode {
    /// Parse a build mode leniently.
    ///
    /// Accepts `sequential`/`concurrent` in any case and integers, where zero
    /// is sequential and any other value concurrent. Only the leading integer
    /// counts, so `5abc` is concurrent. Anything else yields `default` and a
    /// warning.
    #[must_use]
    pub fn parse_or(value: &str, default: Self) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("sequential") {
            return Self::Sequential;
        }
        if value.eq_ignore_ascii_case("concurrent") {
            return Self::Concurrent;
        }
        match leading_int_is_nonzero(value) {
            Some(false) => Self::Sequential,
            Some(true) => Self::Concurrent,
            None => {
                warn!(value, %default, "unrecognized build mode, using default");
                default
            }
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Sequential,
            _ => Self::Concurrent,
        }
    }
}

/// Whether the integer prefix of `value` (optional sign, then digits) is
/// non-zero, or `None` without a digit.
fn leading_int_is_nonzero(value: &str) -> Option<bool> {
    let digits = value.strip_prefix(&['+', '-'][..]).unwrap_or(value);
    let len = digits.bytes().take_while(u8::is_ascii_digit).count();
    (len > 0).then(|| digits.bytes().take(len).any(|b| b != b'0'))
}

/// Parameters of one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Device to select.
    pub device_id: u32,
    /// Scheduler threads, including the builder thread of a delegated build.
    pub scheduler_threads: usize,
    /// Number of blocks; each block contributes one cube and two vector cores.
    pub block_dim: usize,
    /// Build mode of the run.
    pub build_mode: BuildMode,
    /// Bound on stream synchronization and on the handshake check.
    pub wait_bound: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            scheduler_threads: MAX_SCHEDULER_THREADS,
            block_dim: 1,
            build_mode: BuildMode::default(),
            wait_bound: Duration::from_secs(10),
        }
    }
}

impl LaunchConfig {
    /// Defaults overridden by [`BUILD_MODE_ENV`] and [`WAIT_BOUND_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(value) = std::env::var(BUILD_MODE_ENV) {
            cfg.build_mode = BuildMode::parse_or(&value, cfg.build_mode);
        }
        if let Ok(value) = std::env::var(WAIT_BOUND_ENV) {
            match value.trim().parse::<u64>() {
                Ok(ms) => cfg.wait_bound = Duration::from_millis(ms),
                Err(_) => warn!(value, "invalid wait bound, using default"),
            }
        }
        cfg
    }

    /// Reject parameters the platform cannot host.
    ///
    /// # Errors
    /// [`RuntimeError::InvalidLaunch`].
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !(1..=MAX_SCHEDULER_THREADS).contains(&self.scheduler_threads) {
            return Err(RuntimeError::InvalidLaunch {
                reason: "scheduler_threads out of range",
            });
        }
        if !(1..=MAX_BLOCKDIM).contains(&self.block_dim) {
            return Err(RuntimeError::InvalidLaunch {
                reason: "block_dim out of range",
            });
        }
        Ok(())
    }
}
