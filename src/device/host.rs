//! Loopback device: host memory standing in for every memory space.
//!
//! Used for CPU-only deployments of the proxy and throughout the test
//! suite. "Device" pointers are ordinary host pointers, "streams" apply
//! copies immediately, and `alloc_mapped` hands back the same address
//! for both views. Copy counters expose how often the fifo published its
//! tail, which is otherwise invisible from outside.

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Result, TrigonError};

use super::{DeviceApi, Mapped, StreamHandle};

/// Slot alignment is 16; allocating on cache-line boundaries also keeps
/// the fifo's head and tail words off each other's lines.
const ALLOC_ALIGN: usize = 64;

/// Host-memory implementation of [`DeviceApi`].
pub struct HostDevice {
    allocations: Mutex<HashMap<u64, Layout>>,
    next_stream: AtomicU64,
    live_streams: Mutex<HashMap<StreamHandle, ()>>,
    h2d_copies: AtomicU64,
    d2d_copies: AtomicU64,
    mapped_supported: bool,
    numa_node: Option<usize>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            live_streams: Mutex::new(HashMap::new()),
            h2d_copies: AtomicU64::new(0),
            d2d_copies: AtomicU64::new(0),
            mapped_supported: true,
            numa_node: None,
        }
    }

    /// A device that reports GPU-mapped host memory as unsupported,
    /// forcing fifo creation down the pinned-host + async-copy path.
    pub fn without_mapped() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            live_streams: Mutex::new(HashMap::new()),
            h2d_copies: AtomicU64::new(0),
            d2d_copies: AtomicU64::new(0),
            mapped_supported: false,
            numa_node: None,
        }
    }

    /// Report `node` as the device's NUMA node.
    pub fn with_numa_node(mut self, node: usize) -> Self {
        self.numa_node = Some(node);
        self
    }

    /// Host-to-device copies issued so far (tail publications, P2P flag
    /// writes).
    pub fn h2d_copy_count(&self) -> u64 {
        self.h2d_copies.load(Ordering::Acquire)
    }

    /// Device-to-device copies issued so far (P2P puts).
    pub fn d2d_copy_count(&self) -> u64 {
        self.d2d_copies.load(Ordering::Acquire)
    }

    fn alloc_zeroed(&self, bytes: usize) -> Result<u64> {
        let layout = Layout::from_size_align(bytes.max(1), ALLOC_ALIGN).map_err(|e| {
            TrigonError::Allocation {
                bytes,
                reason: e.to_string(),
            }
        })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(TrigonError::Allocation {
                bytes,
                reason: "alloc_zeroed returned null".into(),
            });
        }
        self.allocations
            .lock()
            .expect("allocation table poisoned")
            .insert(ptr as u64, layout);
        Ok(ptr as u64)
    }

    fn release(&self, ptr: u64) -> Result<()> {
        let layout = self
            .allocations
            .lock()
            .expect("allocation table poisoned")
            .remove(&ptr)
            .ok_or_else(|| TrigonError::device(format!("unknown allocation 0x{ptr:x}")))?;
        // SAFETY: ptr/layout pair recorded at allocation time.
        unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        Ok(())
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<()> {
        if self
            .live_streams
            .lock()
            .expect("stream table poisoned")
            .contains_key(&stream)
        {
            Ok(())
        } else {
            Err(TrigonError::device(format!("unknown stream {stream}")))
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceApi for HostDevice {
    fn alloc_host(&self, bytes: usize) -> Result<u64> {
        self.alloc_zeroed(bytes)
    }

    unsafe fn free_host(&self, ptr: u64) -> Result<()> {
        self.release(ptr)
    }

    fn alloc_device(&self, bytes: usize) -> Result<u64> {
        self.alloc_zeroed(bytes)
    }

    unsafe fn free_device(&self, ptr: u64) -> Result<()> {
        self.release(ptr)
    }

    fn alloc_mapped(&self, bytes: usize) -> Result<Option<Mapped>> {
        if !self.mapped_supported {
            return Ok(None);
        }
        let ptr = self.alloc_zeroed(bytes)?;
        Ok(Some(Mapped {
            host: ptr,
            device: ptr,
        }))
    }

    unsafe fn free_mapped(&self, mapped: Mapped) -> Result<()> {
        self.release(mapped.host)
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.live_streams
            .lock()
            .expect("stream table poisoned")
            .insert(id, ());
        Ok(id)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.live_streams
            .lock()
            .expect("stream table poisoned")
            .remove(&stream)
            .ok_or_else(|| TrigonError::device(format!("unknown stream {stream}")))?;
        Ok(())
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: u64,
        src: *const u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_stream(stream)?;
        // SAFETY: caller guarantees both ranges valid for `bytes`.
        unsafe { std::ptr::copy_nonoverlapping(src, dst as *mut u8, bytes) };
        self.h2d_copies.fetch_add(1, Ordering::Release);
        Ok(())
    }

    unsafe fn memcpy_dtod_async(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_stream(stream)?;
        // SAFETY: caller guarantees both ranges valid and disjoint.
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes) };
        self.d2d_copies.fetch_add(1, Ordering::Release);
        Ok(())
    }

    unsafe fn memcpy_dtoh(&self, dst: *mut u8, src: u64, bytes: usize) -> Result<()> {
        // SAFETY: caller guarantees both ranges valid for `bytes`.
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst, bytes) };
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        // Copies are applied at issue time; synchronize only validates
        // the handle.
        self.check_stream(stream)
    }

    fn numa_node(&self) -> Option<usize> {
        self.numa_node
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        // Free anything the owner leaked; the allocator would otherwise
        // never see these again.
        let mut table = self.allocations.lock().expect("allocation table poisoned");
        for (ptr, layout) in table.drain() {
            // SAFETY: ptr/layout pairs recorded at allocation time.
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }
}
