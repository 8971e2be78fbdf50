//! Peer-to-peer transport: GPU-to-GPU copies within one host.
//!
//! `put` is a device-to-device copy on the proxy's P2P stream; the
//! destination is the peer GPU's buffer, reachable because the caller
//! has enabled peer access between the two devices. `signal` stages a
//! monotonically increasing value in a pinned cell and copies it onto
//! the peer's semaphore word on the same stream; stream order is what
//! guarantees the flag lands after the data. `flush` synchronizes the
//! stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::{DeviceApi, StreamHandle};
use crate::error::Result;
use crate::transport::HostConnection;
use crate::types::TransportType;

/// Peer memory a P2P connection writes into. Both addresses are device
/// pointers on the peer GPU, valid while the connection lives.
#[derive(Debug, Clone, Copy)]
pub struct P2pPeerMemory {
    /// Base of the peer's data buffer; trigger `dst_offset` is relative
    /// to this.
    pub data: u64,
    /// The peer's semaphore word, bumped by `signal`.
    pub semaphore: u64,
}

/// A P2P connection: local source buffer, peer destination, one stream.
pub struct P2pConnection {
    device: Arc<dyn DeviceApi>,
    /// The owning proxy's P2P stream. Shared with the proxy, which
    /// synchronizes it during shutdown; not owned here.
    stream: StreamHandle,
    /// Base of the local source buffer; trigger `src_offset` is
    /// relative to this.
    local_data: u64,
    peer: P2pPeerMemory,
    /// Pinned 8-byte cell holding the next semaphore value while the
    /// async copy reads it.
    signal_cell: u64,
    signal_seq: AtomicU64,
}

impl P2pConnection {
    /// Wire up a connection over already-exchanged peer memory.
    ///
    /// `local_data` must be a device pointer on the proxy's GPU and
    /// `peer` must point at the peer GPU's exchanged buffers; both stay
    /// valid for the connection's lifetime.
    pub fn new(
        device: Arc<dyn DeviceApi>,
        stream: StreamHandle,
        local_data: u64,
        peer: P2pPeerMemory,
    ) -> Result<Self> {
        let signal_cell = device.alloc_host(std::mem::size_of::<u64>())?;
        Ok(Self {
            device,
            stream,
            local_data,
            peer,
            signal_cell,
            signal_seq: AtomicU64::new(0),
        })
    }

    /// Number of signals posted so far.
    pub fn signals_posted(&self) -> u64 {
        self.signal_seq.load(Ordering::Acquire)
    }
}

impl HostConnection for P2pConnection {
    fn transport(&self) -> TransportType {
        TransportType::P2p
    }

    fn put(&self, dst_offset: u64, src_offset: u64, size: u64) -> Result<()> {
        // SAFETY: offsets are producer-supplied positions within the
        // exchanged buffers; the bootstrap sized both sides.
        unsafe {
            self.device.memcpy_dtod_async(
                self.peer.data + dst_offset,
                self.local_data + src_offset,
                size as usize,
                self.stream,
            )
        }
    }

    fn signal(&self) -> Result<()> {
        let next = self.signal_seq.fetch_add(1, Ordering::AcqRel) + 1;
        // SAFETY: signal_cell is the live pinned cell owned by this
        // connection. A later signal overwrites it with a larger value;
        // the peer only ever waits for "at least", so the in-flight copy
        // observing the newer value is benign.
        unsafe { &*(self.signal_cell as *const AtomicU64) }.store(next, Ordering::Release);
        unsafe {
            self.device.memcpy_htod_async(
                self.peer.semaphore,
                self.signal_cell as *const u8,
                std::mem::size_of::<u64>(),
                self.stream,
            )
        }
    }

    fn flush(&self) -> Result<()> {
        self.device.synchronize_stream(self.stream)
    }
}

impl Drop for P2pConnection {
    fn drop(&mut self) {
        // SAFETY: signal_cell came from alloc_host and is unused after.
        if let Err(e) = unsafe { self.device.free_host(self.signal_cell) } {
            tracing::warn!(error = %e, "failed to free p2p signal cell");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::transport::dispatch;
    use crate::trigger::{Trigger, TriggerType};

    struct Harness {
        device: Arc<HostDevice>,
        conn: P2pConnection,
        local: u64,
        peer_data: u64,
        peer_sem: u64,
        stream: StreamHandle,
    }

    impl Harness {
        fn new() -> Self {
            let device = Arc::new(HostDevice::new());
            let local = device.alloc_device(4096).unwrap();
            let peer_data = device.alloc_device(4096).unwrap();
            let peer_sem = device.alloc_device(8).unwrap();
            let stream = device.create_stream().unwrap();
            let conn = P2pConnection::new(
                device.clone() as Arc<dyn DeviceApi>,
                stream,
                local,
                P2pPeerMemory {
                    data: peer_data,
                    semaphore: peer_sem,
                },
            )
            .unwrap();
            Self {
                device,
                conn,
                local,
                peer_data,
                peer_sem,
                stream,
            }
        }

        fn write_local(&self, offset: u64, bytes: &[u8]) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    (self.local + offset) as *mut u8,
                    bytes.len(),
                );
            }
        }

        fn read_peer(&self, offset: u64, len: usize) -> Vec<u8> {
            let mut out = vec![0u8; len];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (self.peer_data + offset) as *const u8,
                    out.as_mut_ptr(),
                    len,
                );
            }
            out
        }

        fn peer_semaphore(&self) -> u64 {
            unsafe { *(self.peer_sem as *const u64) }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            unsafe {
                self.device.free_device(self.local).unwrap();
                self.device.free_device(self.peer_data).unwrap();
                self.device.free_device(self.peer_sem).unwrap();
            }
            self.device.destroy_stream(self.stream).unwrap();
        }
    }

    #[test]
    fn test_put_copies_between_offsets() {
        let h = Harness::new();
        h.write_local(0x100, b"gpu payload");
        h.conn.put(0x200, 0x100, 11).unwrap();
        h.conn.flush().unwrap();
        assert_eq!(h.read_peer(0x200, 11), b"gpu payload");
    }

    #[test]
    fn test_signal_bumps_peer_semaphore() {
        let h = Harness::new();
        assert_eq!(h.peer_semaphore(), 0);
        h.conn.signal().unwrap();
        h.conn.signal().unwrap();
        h.conn.flush().unwrap();
        assert_eq!(h.peer_semaphore(), 2);
        assert_eq!(h.conn.signals_posted(), 2);
    }

    #[test]
    fn test_combined_trigger_lands_data_then_flag() {
        let h = Harness::new();
        h.write_local(0, &[0xAB; 64]);
        dispatch(
            &Trigger {
                ty: TriggerType::DATA | TriggerType::FLAG | TriggerType::SYNC,
                conn_id: 0,
                src_offset: 0,
                dst_offset: 64,
                size: 64,
            },
            &h.conn,
        )
        .unwrap();
        assert_eq!(h.read_peer(64, 64), vec![0xAB; 64]);
        assert_eq!(h.peer_semaphore(), 1);
    }
}
