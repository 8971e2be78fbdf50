//! CUDA implementation of the device seam.
//!
//! Uses cudarc 0.19. Device memory, pinned (device-mapped) host memory
//! and non-blocking streams come from the driver API via
//! `cudarc::driver::result`; the context is bound to the calling thread
//! before every operation, so the proxy service thread can use this from
//! wherever it was spawned.

#![cfg(feature = "cuda")]

use std::sync::Arc;

use cudarc::driver::sys;
use cudarc::driver::CudaContext;

use crate::error::{Result, TrigonError};

use super::{DeviceApi, Mapped, StreamHandle};

/// [`DeviceApi`] backed by a CUDA device.
pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    numa_node: Option<usize>,
}

impl CudaDevice {
    /// Create a device handle for the given GPU ordinal.
    pub fn new(device_ordinal: u32) -> Result<Self> {
        let ctx = CudaContext::new(device_ordinal as usize).map_err(|e| {
            TrigonError::device_with_source(
                format!("failed to create CUDA context for GPU {device_ordinal}"),
                e,
            )
        })?;
        Ok(Self {
            ctx,
            numa_node: None,
        })
    }

    /// Record the NUMA node the GPU is attached to; the proxy service
    /// thread binds itself there.
    pub fn with_numa_node(mut self, node: usize) -> Self {
        self.numa_node = Some(node);
        self
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| TrigonError::device_with_source("CUDA bind_to_thread failed", e))
    }
}

impl DeviceApi for CudaDevice {
    fn alloc_host(&self, bytes: usize) -> Result<u64> {
        self.bind()?;
        // Device-mapped so GPU producers can write fifo slots over PCIe.
        let ptr = unsafe {
            cudarc::driver::result::malloc_host(bytes, sys::CU_MEMHOSTALLOC_DEVICEMAP)
        }
        .map_err(|e| TrigonError::Allocation {
            bytes,
            reason: format!("cuMemHostAlloc failed: {e}"),
        })?;
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, bytes) };
        Ok(ptr as u64)
    }

    unsafe fn free_host(&self, ptr: u64) -> Result<()> {
        self.bind()?;
        unsafe { cudarc::driver::result::free_host(ptr as *mut std::ffi::c_void) }
            .map_err(|e| TrigonError::device_with_source("cuMemFreeHost failed", e))
    }

    fn alloc_device(&self, bytes: usize) -> Result<u64> {
        self.bind()?;
        let dptr = unsafe { cudarc::driver::result::malloc_sync(bytes) }.map_err(|e| {
            TrigonError::Allocation {
                bytes,
                reason: format!("cuMemAlloc failed: {e}"),
            }
        })?;
        unsafe { cudarc::driver::result::memset_d8_sync(dptr, 0, bytes) }
            .map_err(|e| TrigonError::device_with_source("cuMemsetD8 failed", e))?;
        Ok(dptr as u64)
    }

    unsafe fn free_device(&self, ptr: u64) -> Result<()> {
        self.bind()?;
        unsafe { cudarc::driver::result::free_sync(ptr as sys::CUdeviceptr) }
            .map_err(|e| TrigonError::device_with_source("cuMemFree failed", e))
    }

    fn alloc_mapped(&self, bytes: usize) -> Result<Option<Mapped>> {
        self.bind()?;
        let host = unsafe {
            cudarc::driver::result::malloc_host(bytes, sys::CU_MEMHOSTALLOC_DEVICEMAP)
        }
        .map_err(|e| TrigonError::Allocation {
            bytes,
            reason: format!("cuMemHostAlloc failed: {e}"),
        })?;
        unsafe { std::ptr::write_bytes(host as *mut u8, 0, bytes) };
        let device = match unsafe { cudarc::driver::result::host_get_device_ptr(host) } {
            Ok(dptr) => dptr,
            Err(_) => {
                // Platform cannot map host memory for the device; callers
                // fall back to split allocations.
                let _ = unsafe { cudarc::driver::result::free_host(host) };
                return Ok(None);
            }
        };
        Ok(Some(Mapped {
            host: host as u64,
            device: device as u64,
        }))
    }

    unsafe fn free_mapped(&self, mapped: Mapped) -> Result<()> {
        self.bind()?;
        unsafe { cudarc::driver::result::free_host(mapped.host as *mut std::ffi::c_void) }
            .map_err(|e| TrigonError::device_with_source("cuMemFreeHost failed", e))
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        self.bind()?;
        let stream = cudarc::driver::result::stream::create(
            cudarc::driver::result::stream::StreamKind::NonBlocking,
        )
        .map_err(|e| TrigonError::device_with_source("cuStreamCreate failed", e))?;
        Ok(stream as u64)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.bind()?;
        unsafe { cudarc::driver::result::stream::destroy(stream as sys::CUstream) }
            .map_err(|e| TrigonError::device_with_source("cuStreamDestroy failed", e))
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: u64,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind()?;
        let src = unsafe { std::slice::from_raw_parts(src, bytes) };
        unsafe {
            cudarc::driver::result::memcpy_htod_async(
                dst as sys::CUdeviceptr,
                src,
                stream as sys::CUstream,
            )
        }
        .map_err(|e| TrigonError::device_with_source("cuMemcpyHtoDAsync failed", e))
    }

    unsafe fn memcpy_dtod_async(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind()?;
        unsafe {
            cudarc::driver::result::memcpy_dtod_async(
                dst as sys::CUdeviceptr,
                src as sys::CUdeviceptr,
                bytes,
                stream as sys::CUstream,
            )
        }
        .map_err(|e| TrigonError::device_with_source("cuMemcpyDtoDAsync failed", e))
    }

    unsafe fn memcpy_dtoh(&self, dst: *mut u8, src: u64, bytes: usize) -> Result<()> {
        self.bind()?;
        let dst = unsafe { std::slice::from_raw_parts_mut(dst, bytes) };
        unsafe { cudarc::driver::result::memcpy_dtoh_sync(dst, src as sys::CUdeviceptr) }
            .map_err(|e| TrigonError::device_with_source("cuMemcpyDtoH failed", e))
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        self.bind()?;
        unsafe { cudarc::driver::result::stream::synchronize(stream as sys::CUstream) }
            .map_err(|e| TrigonError::device_with_source("cuStreamSynchronize failed", e))
    }

    fn numa_node(&self) -> Option<usize> {
        self.numa_node
    }
}
