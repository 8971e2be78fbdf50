//! The device-visible trigger fifo.
//!
//! A single-producer/single-consumer ring of 16-byte triggers. The
//! producer is a GPU kernel (or, on the loopback device, a host thread
//! driving the same protocol); the consumer is one proxy service thread.
//!
//! Three shared words coordinate the two sides:
//!
//! - `head` — next slot the producer will claim. Device-owned; the host
//!   never reads it on the hot path.
//! - the slot's validity word — non-zero marks the slot full. This is
//!   the actual producer→consumer handoff.
//! - `tail_device` — consumer progress as last published to the device.
//!   Producers stall while `head - tail_device == capacity`.
//!
//! The consumer's true position (`tail_host`) advances on every pop but
//! is only published to `tail_device` at the flush cadence the service
//! loop chooses, so the producer can reclaim slots without the host
//! paying a PCIe round-trip per trigger.
//!
//! Memory placement comes in two flavors behind one API: GPU-mapped
//! host memory when the platform supports it (host stores become device
//! loads with no copies), or pinned host slots plus a device-memory tail
//! republished by async copies on a dedicated stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::device::{DeviceApi, Mapped, StreamHandle};
use crate::error::Result;
use crate::trigger::{RawTrigger, Trigger};

const SLOT_BYTES: usize = std::mem::size_of::<RawTrigger>();

/// Where the fifo's shared state lives.
enum Placement {
    /// Slots and device tail in GPU-mapped host memory.
    GpuDirect { slots: Mapped, tail: Mapped },
    /// Slots in pinned host memory (device-visible through unified
    /// addressing); device tail in device memory, published via async
    /// copies from a pinned staging cell on `stream`.
    Fallback {
        slots: u64,
        tail_dev: u64,
        staging: u64,
        stream: StreamHandle,
    },
}

/// The device-side view of a fifo: the raw addresses a kernel needs to
/// produce triggers. All fields are device-visible pointers except
/// `capacity`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DeviceFifo {
    /// Base of the slot array.
    pub slots: u64,
    /// The producer-owned head counter.
    pub head: u64,
    /// The consumer's published tail.
    pub tail: u64,
    /// Ring depth in slots.
    pub capacity: u64,
}

/// Host side of the trigger ring. One per proxy.
pub struct TriggerFifo {
    device: Arc<dyn DeviceApi>,
    placement: Placement,
    /// Host-visible base of the slot array.
    slots_host: u64,
    /// Device-memory head word (producer-owned).
    head_dev: u64,
    /// Next slot to consume. Only the service thread touches this.
    tail_host: u64,
    capacity: usize,
}

// SAFETY: the raw pointers target allocations owned by this fifo (freed
// only in Drop); the SPSC protocol restricts which side writes what.
unsafe impl Send for TriggerFifo {}

impl TriggerFifo {
    /// Allocate and zero all fifo state per the configured placement.
    ///
    /// `config.gpu_direct` asks for GPU-mapped host memory; when the
    /// device reports that unsupported, creation quietly falls back to
    /// the pinned-host + async-copy placement.
    pub fn create(device: Arc<dyn DeviceApi>, config: &ProxyConfig) -> Result<TriggerFifo> {
        let capacity = config.fifo_size;
        let slot_bytes = capacity * SLOT_BYTES;

        let (placement, slots_host) = if config.gpu_direct {
            match (
                device.alloc_mapped(slot_bytes)?,
                device.alloc_mapped(std::mem::size_of::<u64>())?,
            ) {
                (Some(slots), Some(tail)) => {
                    let host = slots.host;
                    (Placement::GpuDirect { slots, tail }, host)
                }
                (slots, tail) => {
                    // Partial support is treated as none.
                    if let Some(m) = slots {
                        unsafe { device.free_mapped(m)? };
                    }
                    if let Some(m) = tail {
                        unsafe { device.free_mapped(m)? };
                    }
                    tracing::debug!(
                        "GPU-mapped host memory unavailable, using pinned-host fifo placement"
                    );
                    Self::fallback_placement(&device, slot_bytes)?
                }
            }
        } else {
            Self::fallback_placement(&device, slot_bytes)?
        };

        let head_dev = device.alloc_device(std::mem::size_of::<u64>())?;

        Ok(TriggerFifo {
            device,
            placement,
            slots_host,
            head_dev,
            tail_host: 0,
            capacity,
        })
    }

    fn fallback_placement(
        device: &Arc<dyn DeviceApi>,
        slot_bytes: usize,
    ) -> Result<(Placement, u64)> {
        let slots = device.alloc_host(slot_bytes)?;
        let tail_dev = device.alloc_device(std::mem::size_of::<u64>())?;
        let staging = device.alloc_host(std::mem::size_of::<u64>())?;
        let stream = device.create_stream()?;
        Ok((
            Placement::Fallback {
                slots,
                tail_dev,
                staging,
                stream,
            },
            slots,
        ))
    }

    /// Ring depth in slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The consumer's private position (next slot to consume).
    pub fn tail_host(&self) -> u64 {
        self.tail_host
    }

    /// Addresses a GPU kernel needs to produce into this fifo.
    pub fn device_view(&self) -> DeviceFifo {
        let (slots, tail) = match &self.placement {
            Placement::GpuDirect { slots, tail } => (slots.device, tail.device),
            // Pinned host memory is device-visible at its host address
            // under unified addressing.
            Placement::Fallback {
                slots, tail_dev, ..
            } => (*slots, *tail_dev),
        };
        DeviceFifo {
            slots,
            head: self.head_dev,
            tail,
            capacity: self.capacity as u64,
        }
    }

    /// Host-visible twin of [`TriggerFifo::device_view`]. Only
    /// meaningful when the device's allocations are host-accessible
    /// (the loopback device; GPU-direct slots/tail on CUDA).
    pub fn host_view(&self) -> DeviceFifo {
        let (slots, tail) = match &self.placement {
            Placement::GpuDirect { slots, tail } => (slots.host, tail.host),
            Placement::Fallback {
                slots, tail_dev, ..
            } => (*slots, *tail_dev),
        };
        DeviceFifo {
            slots,
            head: self.head_dev,
            tail,
            capacity: self.capacity as u64,
        }
    }

    #[inline]
    fn slot(&self, index: u64) -> *const AtomicU64 {
        let offset = (index % self.capacity as u64) as usize * SLOT_BYTES;
        (self.slots_host + offset as u64) as *const AtomicU64
    }

    /// Snapshot the slot at the consumer position.
    ///
    /// The validity word is read first with Acquire; producers publish
    /// it last with Release, so a non-empty result is a complete
    /// trigger and a half-written slot always reads as empty. No
    /// 16-byte atomic is needed under this protocol.
    #[inline]
    pub fn poll(&self) -> RawTrigger {
        let slot = self.slot(self.tail_host);
        // SAFETY: slot points into the live slot allocation; AtomicU64
        // access is the shared-memory protocol with the producer.
        let fst = unsafe { &*slot }.load(Ordering::Acquire);
        if fst == 0 {
            return RawTrigger::EMPTY;
        }
        let snd = unsafe { &*slot.add(1) }.load(Ordering::Relaxed);
        RawTrigger { fst, snd }
    }

    /// Clear the consumed slot and advance the consumer position.
    ///
    /// The validity word is zeroed with Release before `tail_host`
    /// moves, so the slot is observably empty before any later tail
    /// publication lets the producer reclaim its index.
    #[inline]
    pub fn pop(&mut self) {
        let slot = self.slot(self.tail_host);
        // SAFETY: as in `poll`.
        unsafe { &*slot }.store(0, Ordering::Release);
        self.tail_host += 1;
    }

    /// Publish `tail_host` to the device.
    ///
    /// Direct store under GPU-direct; otherwise an async copy on the
    /// fifo's stream, synchronized when `sync` is set.
    pub fn flush_tail(&self, sync: bool) -> Result<()> {
        match &self.placement {
            Placement::GpuDirect { tail, .. } => {
                // SAFETY: tail.host points at the live mapped tail word.
                unsafe { &*(tail.host as *const AtomicU64) }
                    .store(self.tail_host, Ordering::Release);
                Ok(())
            }
            Placement::Fallback {
                tail_dev,
                staging,
                stream,
                ..
            } => {
                // SAFETY: staging is the live 8-byte pinned cell; it must
                // hold the value until the copy is consumed, which the
                // single-threaded flush cadence guarantees (a later flush
                // only overwrites it with a newer tail).
                unsafe { &*(*staging as *const AtomicU64) }
                    .store(self.tail_host, Ordering::Release);
                unsafe {
                    self.device.memcpy_htod_async(
                        *tail_dev,
                        *staging as *const u8,
                        std::mem::size_of::<u64>(),
                        *stream,
                    )?
                };
                if sync {
                    self.device.synchronize_stream(*stream)?;
                }
                Ok(())
            }
        }
    }

    /// Read back the tail as the device currently sees it. Diagnostics
    /// and tests; not part of the hot path.
    pub fn device_tail(&self) -> Result<u64> {
        match &self.placement {
            Placement::GpuDirect { tail, .. } => {
                // SAFETY: live mapped tail word.
                Ok(unsafe { &*(tail.host as *const AtomicU64) }.load(Ordering::Acquire))
            }
            Placement::Fallback { tail_dev, .. } => {
                let mut value = 0u64;
                // SAFETY: 8-byte read into a local from the live device
                // tail word.
                unsafe {
                    self.device.memcpy_dtoh(
                        &mut value as *mut u64 as *mut u8,
                        *tail_dev,
                        std::mem::size_of::<u64>(),
                    )?
                };
                Ok(value)
            }
        }
    }

    /// Read back the producer head. Diagnostics and tests only.
    pub fn device_head(&self) -> Result<u64> {
        let mut value = 0u64;
        // SAFETY: 8-byte read into a local from the live head word.
        unsafe {
            self.device.memcpy_dtoh(
                &mut value as *mut u64 as *mut u8,
                self.head_dev,
                std::mem::size_of::<u64>(),
            )?
        };
        Ok(value)
    }
}

impl Drop for TriggerFifo {
    fn drop(&mut self) {
        // Freeing through the same device that allocated; errors here
        // cannot be surfaced, only logged.
        let report = |what: &str, r: Result<()>| {
            if let Err(e) = r {
                tracing::warn!(error = %e, "failed to free fifo {what}");
            }
        };
        // SAFETY: pointers were allocated in `create` and are not used
        // after this point.
        unsafe {
            report("head", self.device.free_device(self.head_dev));
            match &self.placement {
                Placement::GpuDirect { slots, tail } => {
                    report("slots", self.device.free_mapped(*slots));
                    report("tail", self.device.free_mapped(*tail));
                }
                Placement::Fallback {
                    slots,
                    tail_dev,
                    staging,
                    stream,
                } => {
                    report("slots", self.device.free_host(*slots));
                    report("tail", self.device.free_device(*tail_dev));
                    report("staging", self.device.free_host(*staging));
                    report("stream", self.device.destroy_stream(*stream));
                }
            }
        }
    }
}

/// Reference implementation of the producer protocol.
///
/// This is the same sequence a CUDA kernel runs on device: claim the
/// slot at `head % capacity` after waiting out backpressure against the
/// published tail, write the payload word, release-store the validity
/// word, then bump `head`. On the loopback device it doubles as the
/// test/emulation producer.
///
/// One `FifoProducer` per fifo: the ring is single-producer, and
/// higher layers serialize device-side submitters.
pub struct FifoProducer {
    view: DeviceFifo,
    max_spin: i64,
}

// SAFETY: may move to a producer thread; the pointers stay valid while
// the owning fifo lives, which the caller of `new` guarantees.
unsafe impl Send for FifoProducer {}

impl FifoProducer {
    /// # Safety
    /// Every address in `view` must be host-accessible and outlive this
    /// producer (use [`TriggerFifo::host_view`]); at most one producer
    /// per fifo may exist.
    pub unsafe fn new(view: DeviceFifo, max_spin: i64) -> Self {
        Self { view, max_spin }
    }

    #[inline]
    fn head(&self) -> &AtomicU64 {
        // SAFETY: guaranteed host-accessible by the `new` contract.
        unsafe { &*(self.view.head as *const AtomicU64) }
    }

    #[inline]
    fn tail(&self) -> &AtomicU64 {
        // SAFETY: as above.
        unsafe { &*(self.view.tail as *const AtomicU64) }
    }

    /// Slots currently in flight (claimed but not yet reclaimed via the
    /// published tail).
    pub fn in_flight(&self) -> u64 {
        self.head()
            .load(Ordering::Relaxed)
            .wrapping_sub(self.tail().load(Ordering::Acquire))
    }

    /// Submit one trigger, spinning while the ring is full.
    pub fn push(&self, trigger: &Trigger) {
        self.push_raw(trigger.encode_unchecked());
    }

    /// Submit a pre-packed trigger, spinning while the ring is full.
    pub fn push_raw(&self, raw: RawTrigger) {
        debug_assert!(!raw.is_empty(), "a zero validity word never publishes");
        let head = self.head().load(Ordering::Relaxed);
        let capacity = self.view.capacity;
        crate::poll_maybe_jailbreak!(
            head.wrapping_sub(self.tail().load(Ordering::Acquire)) >= capacity,
            self.max_spin
        );

        let offset = (head % capacity) as usize * SLOT_BYTES;
        let slot = (self.view.slots + offset as u64) as *const AtomicU64;
        // SAFETY: in-bounds slot of the live ring; the backpressure wait
        // above guarantees the consumer has cleared it.
        unsafe {
            (*slot.add(1)).store(raw.snd, Ordering::Relaxed);
            // Publishing the validity word last is what lets the
            // consumer treat any non-zero read as a complete trigger.
            (*slot).store(raw.fst, Ordering::Release);
        }
        self.head().store(head.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::trigger::TriggerType;

    fn small_config(gpu_direct: bool) -> ProxyConfig {
        ProxyConfig {
            fifo_size: 8,
            gpu_direct,
            ..ProxyConfig::default()
        }
    }

    fn trig(conn_id: u32, size: u64) -> Trigger {
        Trigger {
            ty: TriggerType::DATA,
            conn_id,
            src_offset: 0x100,
            dst_offset: 0x200,
            size,
        }
    }

    fn fifo_pair(gpu_direct: bool) -> (Arc<HostDevice>, TriggerFifo, FifoProducer) {
        let device = Arc::new(HostDevice::new());
        let fifo = TriggerFifo::create(device.clone(), &small_config(gpu_direct)).unwrap();
        let producer = unsafe { FifoProducer::new(fifo.host_view(), -1) };
        (device, fifo, producer)
    }

    #[test]
    fn test_empty_poll() {
        for gdr in [false, true] {
            let (_d, fifo, _p) = fifo_pair(gdr);
            assert!(fifo.poll().is_empty());
            assert_eq!(fifo.tail_host(), 0);
        }
    }

    #[test]
    fn test_push_poll_pop() {
        for gdr in [false, true] {
            let (_d, mut fifo, producer) = fifo_pair(gdr);
            producer.push(&trig(3, 4096));
            let raw = fifo.poll();
            assert!(!raw.is_empty());
            let t = Trigger::decode(raw);
            assert_eq!(t.conn_id, 3);
            assert_eq!(t.size, 4096);
            fifo.pop();
            assert_eq!(fifo.tail_host(), 1);
            // Nothing further was produced, so the next slot reads empty.
            assert!(fifo.poll().is_empty());
        }
    }

    #[test]
    fn test_pop_clears_slot() {
        let (_d, mut fifo, producer) = fifo_pair(false);
        producer.push(&trig(0, 1));
        fifo.pop();
        // Re-polling index 0 directly: wind the producer all the way
        // around so the consumer lands on slot 0 again; it must read
        // empty until rewritten.
        let view = fifo.host_view();
        let slot0 = unsafe { &*(view.slots as *const AtomicU64) };
        assert_eq!(slot0.load(std::sync::atomic::Ordering::Acquire), 0);
    }

    #[test]
    fn test_fifo_order_across_wrap() {
        let (_d, mut fifo, producer) = fifo_pair(false);
        // 20 triggers through an 8-deep ring, consuming as we go.
        for i in 0..20u64 {
            producer.push(&trig((i % 4) as u32, i + 1));
            let raw = fifo.poll();
            assert!(!raw.is_empty());
            assert_eq!(Trigger::decode(raw).size, i + 1);
            fifo.pop();
            fifo.flush_tail(false).unwrap();
        }
        assert_eq!(fifo.tail_host(), 20);
    }

    #[test]
    fn test_flush_tail_direct_store() {
        let (device, mut fifo, producer) = fifo_pair(true);
        let before = device.h2d_copy_count();
        producer.push(&trig(0, 1));
        fifo.pop();
        fifo.flush_tail(false).unwrap();
        assert_eq!(fifo.device_tail().unwrap(), 1);
        // GPU-direct publication is a store, not a copy.
        assert_eq!(device.h2d_copy_count(), before);
    }

    #[test]
    fn test_flush_tail_fallback_copies() {
        let (device, mut fifo, producer) = fifo_pair(false);
        producer.push(&trig(0, 1));
        fifo.pop();
        assert_eq!(fifo.device_tail().unwrap(), 0);
        fifo.flush_tail(true).unwrap();
        assert_eq!(fifo.device_tail().unwrap(), 1);
        assert_eq!(device.h2d_copy_count(), 1);
    }

    #[test]
    fn test_gpu_direct_falls_back_when_unsupported() {
        let device = Arc::new(HostDevice::without_mapped());
        let fifo = TriggerFifo::create(device.clone(), &small_config(true)).unwrap();
        let producer = unsafe { FifoProducer::new(fifo.host_view(), -1) };
        producer.push(&trig(1, 2));
        assert!(!fifo.poll().is_empty());
        // Publication goes through the copy path.
        fifo.flush_tail(false).unwrap();
        assert_eq!(device.h2d_copy_count(), 1);
    }

    #[test]
    fn test_producer_backpressure_respects_published_tail() {
        let (_d, mut fifo, producer) = fifo_pair(false);
        for i in 0..8 {
            producer.push(&trig(0, i + 1));
        }
        assert_eq!(producer.in_flight(), 8);
        // Consume two but publish only afterwards: producer still sees a
        // full ring until flush_tail.
        fifo.pop();
        fifo.pop();
        assert_eq!(producer.in_flight(), 8);
        fifo.flush_tail(false).unwrap();
        assert_eq!(producer.in_flight(), 6);
        producer.push(&trig(0, 9));
        producer.push(&trig(0, 10));
        assert_eq!(producer.in_flight(), 8);
    }

    #[test]
    fn test_producer_spins_until_consumer_publishes() {
        let device = Arc::new(HostDevice::new());
        let mut fifo = TriggerFifo::create(device.clone(), &small_config(false)).unwrap();
        let producer = unsafe { FifoProducer::new(fifo.host_view(), -1) };
        for i in 0..8 {
            producer.push(&trig(0, i + 1));
        }
        // Ninth push blocks until the consumer frees a slot.
        let handle = std::thread::spawn(move || {
            producer.push(&trig(0, 9));
            producer
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        fifo.pop();
        fifo.flush_tail(false).unwrap();
        let producer = handle.join().unwrap();
        assert_eq!(producer.in_flight(), 8);
        // Drain the rest so Drop sees a quiet ring.
        while !fifo.poll().is_empty() {
            fifo.pop();
        }
    }

    #[test]
    fn test_concurrent_producer_never_yields_torn_reads() {
        let device = Arc::new(HostDevice::new());
        let mut fifo = TriggerFifo::create(device.clone(), &small_config(false)).unwrap();
        let producer = unsafe { FifoProducer::new(fifo.host_view(), -1) };

        const N: u64 = 10_000;
        let handle = std::thread::spawn(move || {
            for i in 0..N {
                producer.push(&Trigger {
                    ty: TriggerType::DATA,
                    conn_id: 7,
                    // Payload correlated with the validity word's size
                    // field so a torn read is detectable.
                    src_offset: (i + 1) & 0xFFFF_FFFF,
                    dst_offset: (i + 1) & 0xFFFF_FFFF,
                    size: (i + 1) & 0xFFFF_FFFF,
                });
            }
        });

        let mut seen = 0u64;
        while seen < N {
            let raw = fifo.poll();
            if raw.is_empty() {
                std::hint::spin_loop();
                continue;
            }
            let t = Trigger::decode(raw);
            assert_eq!(t.conn_id, 7);
            assert_eq!(t.size, (seen + 1) & 0xFFFF_FFFF);
            assert_eq!(t.src_offset, t.size);
            assert_eq!(t.dst_offset, t.size);
            fifo.pop();
            seen += 1;
            if seen % 4 == 0 {
                fifo.flush_tail(false).unwrap();
            }
        }
        handle.join().unwrap();
    }
}
