use crate::{
    coordinator::RuntimeError,
    device::Device,
    runtime::Runtime,
    types::DeviceAddr,
};
use derive_more::Debug;
use tracing::debug;

/// A top-level argument of a run, classified for marshalling.
#[derive(Debug)]
pub enum Arg<'a> {
    /// Passed by value.
    Scalar(u64),
    /// Copied to the device before the run.
    Input(#[debug("{} bytes", _0.len())] &'a [u8]),
    /// Copied back to the host after a successful run.
    Output(#[debug("{} bytes", _0.len())] &'a mut [u8]),
    /// Copied both ways.
    InOut(#[debug("{} bytes", _0.len())] &'a mut [u8]),
}

impl Arg<'_> {
    /// Scalar carrying the bit pattern of an `f32`.
    #[must_use]
    pub fn f32(value: f32) -> Self {
        Self::Scalar(u64::from(value.to_bits()))
    }
}

/// A device memory grant, released exactly once when the run is finalized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAllocation {
    /// Device address.
    pub addr: DeviceAddr,
    /// Size in bytes.
    pub size: usize,
}

/// Host buffer that receives the content of a device buffer after the run.
#[derive(Debug)]
pub(crate) struct TensorCopyBack<'a> {
    #[debug("{} bytes", host.len())]
    pub(crate) host: &'a mut [u8],
    pub(crate) device: DeviceAddr,
}

/// A Runtime Instance prepared for one run, together with its host-side
/// bookkeeping.
///
/// Produced by [`Coordinator::init_runtime`](super::Coordinator::init_runtime)
/// and consumed by [`Coordinator::run`](super::Coordinator::run). Borrows the
/// host output buffers until then.
#[derive(Debug)]
pub struct Session<'a> {
    pub(crate) runtime: Box<Runtime>,
    pub(crate) allocations: Vec<DeviceAllocation>,
    pub(crate) copy_back: Vec<TensorCopyBack<'a>>,
    /// Device copy of the runtime, once transferred.
    pub(crate) runtime_addr: Option<DeviceAddr>,
    /// Whether the device copy holds a complete transfer of the runtime.
    pub(crate) on_device: bool,
}

impl<'a> Session<'a> {
    pub(crate) fn new(runtime: Box<Runtime>) -> Self {
        Self {
            runtime,
            allocations: vec![],
            copy_back: vec![],
            runtime_addr: None,
            on_device: false,
        }
    }

    /// The prepared Runtime Instance.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Device allocations made while marshalling.
    #[must_use]
    pub fn allocations(&self) -> &[DeviceAllocation] {
        &self.allocations
    }

    /// Number of buffers that will be copied back.
    #[must_use]
    pub fn copy_back_len(&self) -> usize {
        self.copy_back.len()
    }

    /// Allocate and fill device buffers for `args` and return the
    /// orchestration arguments. Everything allocated is recorded in the
    /// session even on failure, so finalizing releases it.
    pub(crate) fn marshal<D: Device>(
        &mut self,
        device: &D,
        args: Vec<Arg<'a>>,
    ) -> Result<Vec<u64>, RuntimeError> {
        let mut orch_args = Vec::with_capacity(args.len());
        for (idx, arg) in args.into_iter().enumerate() {
            let value = match arg {
                Arg::Scalar(value) => value,
                Arg::Input(host) => {
                    let addr = self.allocate(device, host.len())?;
                    device.copy_to_device(addr, host)?;
                    addr
                }
                Arg::Output(host) => {
                    let addr = self.allocate(device, host.len())?;
                    self.copy_back.push(TensorCopyBack { host, device: addr });
                    addr
                }
                Arg::InOut(host) => {
                    let addr = self.allocate(device, host.len())?;
                    device.copy_to_device(addr, host)?;
                    self.copy_back.push(TensorCopyBack { host, device: addr });
                    addr
                }
            };
            debug!(arg = idx, value, "argument marshalled");
            orch_args.push(value);
        }
        Ok(orch_args)
    }

    fn allocate<D: Device>(&mut self, device: &D, size: usize) -> Result<DeviceAddr, RuntimeError> {
        let addr = device.allocate(size)?;
        self.allocations.push(DeviceAllocation { addr, size });
        Ok(addr)
    }
}
