//! The device seam between the proxy and the GPU runtime.
//!
//! Trigon operates on raw `u64` pointers + byte counts, and a `u64`
//! stream handle. The [`DeviceApi`] trait supplies the allocators and
//! copy/stream primitives the fifo and the P2P transport need:
//!
//! - [`HostDevice`] (built-in): host memory standing in for every space;
//!   used for CPU-only deployments and tests.
//! - [`CudaDevice`] (feature `cuda`): real device memory, pinned host
//!   memory and CUDA streams via cudarc.

mod host;

#[cfg(feature = "cuda")]
mod cuda;

pub use host::HostDevice;

#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;

use crate::error::Result;

/// Opaque non-blocking stream handle. For CUDA this is the raw
/// `cudaStream_t` value; the loopback device uses a synthetic id.
pub type StreamHandle = u64;

/// A host allocation mapped into the device's address space.
///
/// Stores through `host` are visible to device loads at `device` without
/// explicit copies (GPU-direct). The two addresses may differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapped {
    pub host: u64,
    pub device: u64,
}

/// Memory, copy and stream primitives the proxy needs from a device
/// runtime.
///
/// All allocators return zero-initialized memory. Pointer-taking methods
/// are `unsafe`: the contract that a pointer came from the matching
/// allocator (and is not used after free) cannot be checked here.
pub trait DeviceApi: Send + Sync {
    /// Allocate pinned host memory the device can read and write.
    fn alloc_host(&self, bytes: usize) -> Result<u64>;

    /// Release an [`DeviceApi::alloc_host`] allocation.
    ///
    /// # Safety
    /// `ptr` must come from `alloc_host` on this device and must not be
    /// used afterwards.
    unsafe fn free_host(&self, ptr: u64) -> Result<()>;

    /// Allocate device memory.
    fn alloc_device(&self, bytes: usize) -> Result<u64>;

    /// Release an [`DeviceApi::alloc_device`] allocation.
    ///
    /// # Safety
    /// `ptr` must come from `alloc_device` on this device and must not
    /// be used afterwards.
    unsafe fn free_device(&self, ptr: u64) -> Result<()>;

    /// Allocate host memory mapped into the device's address space
    /// (GPU-direct). Returns `None` when the platform cannot map host
    /// memory for the device; callers fall back to split allocations.
    fn alloc_mapped(&self, bytes: usize) -> Result<Option<Mapped>>;

    /// Release an [`DeviceApi::alloc_mapped`] allocation.
    ///
    /// # Safety
    /// `mapped` must come from `alloc_mapped` on this device and must
    /// not be used afterwards.
    unsafe fn free_mapped(&self, mapped: Mapped) -> Result<()>;

    /// Create a non-blocking stream.
    fn create_stream(&self) -> Result<StreamHandle>;

    /// Destroy a stream created by [`DeviceApi::create_stream`].
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Asynchronous host-to-device copy on `stream`.
    ///
    /// # Safety
    /// `src` must stay valid for `bytes` bytes until the stream has been
    /// synchronized; `dst` must be device-visible memory of at least
    /// `bytes` bytes.
    unsafe fn memcpy_htod_async(
        &self,
        dst: u64,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Asynchronous device-to-device copy on `stream`.
    ///
    /// # Safety
    /// `dst` and `src` must be device-visible pointers valid for
    /// `bytes` bytes; the ranges must not overlap.
    unsafe fn memcpy_dtod_async(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Synchronous device-to-host copy. Diagnostics and teardown only,
    /// never on the proxy hot path.
    ///
    /// # Safety
    /// `dst` must be valid for `bytes` bytes; `src` must be
    /// device-visible memory of at least `bytes` bytes.
    unsafe fn memcpy_dtoh(&self, dst: *mut u8, src: u64, bytes: usize) -> Result<()>;

    /// Block until all work queued on `stream` has completed.
    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()>;

    /// NUMA node closest to the device, if known. The service thread
    /// binds itself there before polling.
    fn numa_node(&self) -> Option<usize>;
}
