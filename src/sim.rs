//! Simulation backend.
//!
//! Device memory is ordinary heap memory, so device addresses are host
//! pointers. Streams are rayon thread pools with one thread per launched
//! instance, since every device-side routine polls and must not share a thread
//! with the routine it waits on. Compute routines and delegates are linked
//! statically by function id and entry name instead of being loaded from their
//! images.

use crate::{
    config::Config,
    delegate::{BuildApi, DelegateFn},
    device::{Device, DeviceEnv, DeviceError, Routine},
    exec,
    graph::GraphError,
    runtime::Runtime,
    sync::{AtomicBool, Ordering},
    types::{DeviceAddr, FuncId, HashMap, HashSet},
};
use core::{alloc::Layout, ptr, time::Duration};
use derive_more::Debug;
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, error, warn};

/// Alignment of every simulated device allocation.
pub const SIM_ALIGN: usize = 128;

const _: () = assert!(align_of::<Runtime>() <= SIM_ALIGN);

/// How long [`Device::abort`] waits for cancelled routines to return.
const ABORT_DRAIN_BOUND: Duration = Duration::from_secs(5);

/// Binds the simulation backend.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig;

impl Config for SimConfig {
    type Device = SimDevice;
}

/// A statically linked compute routine.
pub type SimKernel = Arc<dyn Fn(&SimMemory, &[u64]) -> Result<(), DeviceError> + Send + Sync>;

/// Simulated device memory.
#[derive(Debug, Clone)]
pub struct SimMemory {
    inner: Arc<Mutex<Heap>>,
}

#[derive(Debug, Default)]
struct Heap {
    /// Base address to requested size.
    allocs: BTreeMap<DeviceAddr, usize>,
    in_use: usize,
    limit: Option<usize>,
}

impl Heap {
    fn check(&self, addr: DeviceAddr, len: usize) -> Result<(), DeviceError> {
        let invalid = DeviceError::InvalidAddress { addr, len };
        let (&base, &size) = self.allocs.range(..=addr).next_back().ok_or(invalid.clone())?;
        let end = addr.checked_add(len as u64).ok_or(invalid.clone())?;
        if end > base + size as u64 {
            return Err(invalid);
        }
        Ok(())
    }
}

fn heap_layout(size: usize) -> Result<Layout, DeviceError> {
    Layout::from_size_align(size.max(1), SIM_ALIGN)
        .map_err(|_| DeviceError::AllocationFailed { size })
}

impl SimMemory {
    fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Heap {
                limit,
                ..Heap::default()
            })),
        }
    }

    fn allocate(&self, size: usize) -> Result<DeviceAddr, DeviceError> {
        let mut heap = self.inner.lock();
        let in_use = heap
            .in_use
            .checked_add(size)
            .ok_or(DeviceError::AllocationFailed { size })?;
        if heap.limit.is_some_and(|limit| in_use > limit) {
            return Err(DeviceError::AllocationFailed { size });
        }
        let layout = heap_layout(size)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DeviceError::AllocationFailed { size });
        }
        let addr = ptr as DeviceAddr;
        heap.allocs.insert(addr, size);
        heap.in_use = in_use;
        Ok(addr)
    }

    fn free(&self, addr: DeviceAddr) -> Result<(), DeviceError> {
        let mut heap = self.inner.lock();
        let size = heap
            .allocs
            .remove(&addr)
            .ok_or(DeviceError::InvalidAddress { addr, len: 0 })?;
        heap.in_use -= size;
        // SAFETY: `addr` was returned by `alloc_zeroed` with this layout and is
        // removed from the table, so it is freed once.
        unsafe { std::alloc::dealloc(addr as *mut u8, heap_layout(size)?) };
        Ok(())
    }

    fn release_all(&self) {
        let mut heap = self.inner.lock();
        for (addr, size) in core::mem::take(&mut heap.allocs) {
            if let Ok(layout) = heap_layout(size) {
                // SAFETY: as in `free`.
                unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
            }
        }
        heap.in_use = 0;
    }

    /// Copy `src` into device memory at `dst`.
    ///
    /// # Errors
    /// [`DeviceError::InvalidAddress`] unless the range lies in one live
    /// allocation.
    pub fn write(&self, dst: DeviceAddr, src: &[u8]) -> Result<(), DeviceError> {
        let heap = self.inner.lock();
        heap.check(dst, src.len())?;
        // SAFETY: the range is inside a live allocation, which cannot be freed
        // while the heap lock is held.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len()) };
        Ok(())
    }

    /// Copy device memory at `src` into `dst`.
    ///
    /// # Errors
    /// [`DeviceError::InvalidAddress`] unless the range lies in one live
    /// allocation.
    pub fn read(&self, dst: &mut [u8], src: DeviceAddr) -> Result<(), DeviceError> {
        let heap = self.inner.lock();
        heap.check(src, dst.len())?;
        // SAFETY: as in `write`.
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Read `count` native-endian `f32`s at `src`.
    ///
    /// # Errors
    /// As [`SimMemory::read`].
    pub fn read_f32s(&self, src: DeviceAddr, count: usize) -> Result<Vec<f32>, DeviceError> {
        let mut bytes = vec![0u8; count * size_of::<f32>()];
        self.read(&mut bytes, src)?;
        Ok(bytes
            .chunks_exact(size_of::<f32>())
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Write `values` as native-endian `f32`s at `dst`.
    ///
    /// # Errors
    /// As [`SimMemory::write`].
    pub fn write_f32s(&self, dst: DeviceAddr, values: &[f32]) -> Result<(), DeviceError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.write(dst, &bytes)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().allocs.len()
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().in_use
    }
}

/// State shared by the device handle and the routines it launched.
#[derive(Debug)]
struct Shared {
    memory: SimMemory,
    #[debug("{} kernels", kernels.len())]
    kernels: HashMap<FuncId, SimKernel>,
    #[debug("{} delegates", delegates.len())]
    delegates: HashMap<String, DelegateFn>,
    /// Device address of each loaded kernel image.
    loaded: RwLock<HashMap<DeviceAddr, FuncId>>,
    offline_cores: HashSet<usize>,
    cancel: AtomicBool,
    inflight: Mutex<usize>,
    drained: Condvar,
}

impl Shared {
    fn retire_instance(&self) {
        let mut inflight = self.inflight.lock();
        *inflight -= 1;
        if *inflight == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        let mut inflight = self.inflight.lock();
        while *inflight > 0 {
            if self.drained.wait_until(&mut inflight, deadline).timed_out() {
                return *inflight == 0;
            }
        }
        true
    }

    fn run_instance(&self, routine: Routine, idx: usize, runtime_addr: DeviceAddr) {
        if routine == Routine::Compute && self.offline_cores.contains(&idx) {
            debug!(core = idx, "core offline");
            return;
        }
        // SAFETY: `runtime_addr` is a live, suitably aligned allocation holding
        // a Runtime Instance copied by the coordinator, and it is not freed before
        // the streams drained.
        let runtime = unsafe { &*(runtime_addr as *const Runtime) };
        let result = catch_unwind(AssertUnwindSafe(|| match routine {
            Routine::Build => exec::build(runtime, self),
            Routine::Schedule => exec::schedule(runtime, idx, self),
            Routine::Compute => exec::compute(runtime, idx, self),
        }));
        if result.is_err() {
            exec::worker_panicked(runtime, routine, idx);
        }
    }
}

impl DeviceEnv for Shared {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn invoke(&self, function_addr: DeviceAddr, args: &[u64]) -> Result<(), DeviceError> {
        let func_id = self
            .loaded
            .read()
            .get(&function_addr)
            .copied()
            .ok_or(DeviceError::UnknownKernel {
                addr: function_addr,
            })?;
        let kernel = self
            .kernels
            .get(&func_id)
            .ok_or(DeviceError::KernelNotLinked { func_id })?;
        match catch_unwind(AssertUnwindSafe(|| kernel(&self.memory, args))) {
            Ok(result) => result,
            Err(_) => Err(DeviceError::KernelFault {
                func_id,
                reason: "panicked".to_owned(),
            }),
        }
    }

    fn device_malloc(&self, size: usize) -> Result<DeviceAddr, DeviceError> {
        self.memory.allocate(size)
    }

    fn resolve_delegate(&self, _image: &[u8], entry: &str) -> Result<DelegateFn, DeviceError> {
        self.delegates
            .get(entry)
            .cloned()
            .ok_or_else(|| DeviceError::DelegateNotLinked {
                entry: entry.to_owned(),
            })
    }
}

/// Builder of a [`SimDevice`].
#[must_use]
#[derive(Debug, Default)]
pub struct SimDeviceBuilder {
    #[debug("{} kernels", kernels.len())]
    kernels: HashMap<FuncId, SimKernel>,
    #[debug("{} delegates", delegates.len())]
    delegates: HashMap<String, DelegateFn>,
    memory_limit: Option<usize>,
    offline_cores: HashSet<usize>,
}

impl SimDeviceBuilder {
    /// Link the compute routine of `func_id`.
    pub fn kernel(
        mut self,
        func_id: FuncId,
        kernel: impl Fn(&SimMemory, &[u64]) -> Result<(), DeviceError> + Send + Sync + 'static,
    ) -> Self {
        self.kernels.insert(func_id, Arc::new(kernel));
        self
    }

    /// Link a delegate under `entry`.
    pub fn delegate(
        mut self,
        entry: impl Into<String>,
        delegate: impl Fn(&mut BuildApi<'_>) -> Result<(), GraphError> + Send + Sync + 'static,
    ) -> Self {
        self.delegates.insert(entry.into(), Arc::new(delegate));
        self
    }

    /// Cap the bytes of device memory that may be allocated at once.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Keep compute core `core` from ever starting. Its handshake slot stays
    /// `not-started`.
    pub fn offline_core(mut self, core: usize) -> Self {
        self.offline_cores.insert(core);
        self
    }

    /// Finish the device.
    pub fn build(self) -> SimDevice {
        SimDevice {
            shared: Arc::new(Shared {
                memory: SimMemory::new(self.memory_limit),
                kernels: self.kernels,
                delegates: self.delegates,
                loaded: RwLock::default(),
                offline_cores: self.offline_cores,
                cancel: AtomicBool::new(false),
                inflight: Mutex::new(0),
                drained: Condvar::new(),
            }),
            streams: Mutex::default(),
            contexts: Mutex::new(None),
            contexts_created: Mutex::new(0),
        }
    }
}

/// The simulated device.
#[derive(Debug)]
pub struct SimDevice {
    shared: Arc<Shared>,
    #[debug("{} streams", streams.lock().len())]
    streams: Mutex<Vec<ThreadPool>>,
    /// Selected device id.
    contexts: Mutex<Option<u32>>,
    contexts_created: Mutex<usize>,
}

impl SimDevice {
    /// Start configuring a simulated device.
    pub fn builder() -> SimDeviceBuilder {
        SimDeviceBuilder::default()
    }

    /// Handle to the device memory, for kernels, delegates and tests.
    #[must_use]
    pub fn memory(&self) -> SimMemory {
        self.shared.memory.clone()
    }

    /// How many times execution contexts were created.
    #[must_use]
    pub fn contexts_created(&self) -> usize {
        *self.contexts_created.lock()
    }

    fn ensure_ready(&self) -> Result<(), DeviceError> {
        self.contexts
            .lock()
            .map(|_| ())
            .ok_or(DeviceError::NotReady)
    }
}

impl Device for SimDevice {
    fn set_device(&self, device_id: u32) -> Result<(), DeviceError> {
        let mut contexts = self.contexts.lock();
        if contexts.is_none() {
            *contexts = Some(device_id);
            *self.contexts_created.lock() += 1;
            debug!(device_id, "simulated contexts created");
        }
        Ok(())
    }

    fn allocate(&self, size: usize) -> Result<DeviceAddr, DeviceError> {
        self.ensure_ready()?;
        self.shared.memory.allocate(size)
    }

    fn free(&self, addr: DeviceAddr) -> Result<(), DeviceError> {
        self.shared.loaded.write().remove(&addr);
        self.shared.memory.free(addr)
    }

    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<(), DeviceError> {
        self.shared.memory.write(dst, src)
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<(), DeviceError> {
        self.shared.memory.read(dst, src)
    }

    fn load_kernel(&self, func_id: FuncId, image: &[u8]) -> Result<DeviceAddr, DeviceError> {
        if !self.shared.kernels.contains_key(&func_id) {
            return Err(DeviceError::KernelNotLinked { func_id });
        }
        let addr = self.allocate(image.len())?;
        if let Err(err) = self.shared.memory.write(addr, image) {
            let _ = self.shared.memory.free(addr);
            return Err(err);
        }
        self.shared.loaded.write().insert(addr, func_id);
        Ok(addr)
    }

    fn launch(
        &self,
        routine: Routine,
        instances: usize,
        runtime: DeviceAddr,
    ) -> Result<(), DeviceError> {
        self.ensure_ready()?;
        self.shared
            .memory
            .inner
            .lock()
            .check(runtime, size_of::<Runtime>())?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(instances)
            .thread_name(move |idx| format!("tgr-{routine}-{idx}"))
            .build()
            .map_err(|err| DeviceError::Launch {
                routine,
                reason: err.to_string(),
            })?;
        *self.shared.inflight.lock() += instances;
        for idx in 0..instances {
            let shared = Arc::clone(&self.shared);
            pool.spawn(move || {
                shared.run_instance(routine, idx, runtime);
                shared.retire_instance();
            });
        }
        self.streams.lock().push(pool);
        debug!(%routine, instances, "routine launched");
        Ok(())
    }

    fn synchronize(&self, bound: Duration) -> Result<(), DeviceError> {
        if !self.shared.wait_drained(bound) {
            return Err(DeviceError::Timeout { bound });
        }
        self.streams.lock().clear();
        Ok(())
    }

    fn abort(&self) -> bool {
        self.shared.cancel.store(true, Ordering::Release);
        let drained = self.shared.wait_drained(ABORT_DRAIN_BOUND);
        if drained {
            self.streams.lock().clear();
            self.shared.cancel.store(false, Ordering::Release);
        } else {
            error!("streams did not drain after cancellation");
        }
        drained
    }

    fn release(&self) {
        if *self.shared.inflight.lock() > 0 {
            warn!("releasing device with routines in flight, leaking device memory");
        } else {
            self.shared.memory.release_all();
        }
        self.shared.loaded.write().clear();
        *self.contexts.lock() = None;
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        if *self.shared.inflight.lock() == 0 {
            self.shared.memory.release_all();
        }
    }
}
