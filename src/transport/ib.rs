//! InfiniBand/RoCE transport via raw `ibverbs-sys` FFI (no safe
//! wrapper).
//!
//! The proxy does not build queue pairs: bootstrap hands over a QP
//! already in RTS together with the exchanged memory keys, and this
//! module only posts work to it: `put` is an RDMA WRITE into the peer's
//! data region, `signal` an RDMA WRITE of a monotonically increasing
//! value onto the peer's semaphore word, `flush` a CQ drain of
//! everything posted so far.

#![cfg(feature = "ib")]

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use ibverbs_sys::{ibv_send_flags, ibv_wr_opcode};

use crate::error::{Result, TrigonError};
use crate::transport::HostConnection;
use crate::types::{ConnId, TransportType};

/// Local memory a connection sends from.
#[derive(Debug, Clone, Copy)]
pub struct IbLocalMemory {
    /// Base address of the registered source buffer; trigger
    /// `src_offset` is relative to this.
    pub addr: u64,
    pub lkey: u32,
}

/// Peer memory exchanged during bootstrap.
#[derive(Debug, Clone, Copy)]
pub struct IbRemoteMemory {
    /// Base of the peer's data region; trigger `dst_offset` is relative
    /// to this.
    pub addr: u64,
    pub rkey: u32,
    /// The peer's 8-byte semaphore word.
    pub semaphore_addr: u64,
    pub semaphore_rkey: u32,
}

/// A registered 8-byte host cell the signal value is written from.
#[derive(Debug, Clone, Copy)]
pub struct IbSignalCell {
    pub addr: u64,
    pub lkey: u32,
}

/// Timeout for draining the completion queue in `flush`.
const CQ_POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A fully connected RC queue pair driven by one proxy.
pub struct IbConnection {
    conn_id: ConnId,
    qp: *mut ibverbs_sys::ibv_qp,
    send_cq: *mut ibverbs_sys::ibv_cq,
    local: IbLocalMemory,
    remote: IbRemoteMemory,
    signal_cell: IbSignalCell,
    signal_seq: AtomicU64,
    /// Work requests posted but not yet reaped from the CQ.
    outstanding: AtomicU64,
}

// SAFETY: the raw ibverbs pointers are thread-safe per the verbs spec;
// the proxy serializes use anyway (one service thread per connection).
unsafe impl Send for IbConnection {}
unsafe impl Sync for IbConnection {}

impl IbConnection {
    /// Take ownership of an established QP.
    ///
    /// # Safety
    /// - `qp` must be in RTS with `send_cq` as its send CQ; both are
    ///   destroyed when the connection drops.
    /// - `local` and `signal_cell` must name memory registered on the
    ///   QP's PD; `remote` must carry the peer's exchanged keys.
    /// - No other CQ consumer may poll `send_cq`.
    pub unsafe fn new(
        conn_id: ConnId,
        qp: *mut ibverbs_sys::ibv_qp,
        send_cq: *mut ibverbs_sys::ibv_cq,
        local: IbLocalMemory,
        remote: IbRemoteMemory,
        signal_cell: IbSignalCell,
    ) -> Self {
        Self {
            conn_id,
            qp,
            send_cq,
            local,
            remote,
            signal_cell,
            signal_seq: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
        }
    }

    fn post_write(
        &self,
        local_addr: u64,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        length: u32,
        wr_id: u64,
    ) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = local_addr;
            sge.length = length;
            sge.lkey = lkey;

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;

            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let rc = ops.post_send.as_mut().expect("post_send missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            );
            if rc != 0 {
                return Err(TrigonError::transport(
                    self.conn_id,
                    format!("post_send failed (rc={rc})"),
                ));
            }
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Number of signals posted so far.
    pub fn signals_posted(&self) -> u64 {
        self.signal_seq.load(Ordering::Acquire)
    }
}

impl HostConnection for IbConnection {
    fn transport(&self) -> TransportType {
        TransportType::Ib
    }

    fn put(&self, dst_offset: u64, src_offset: u64, size: u64) -> Result<()> {
        self.post_write(
            self.local.addr + src_offset,
            self.local.lkey,
            self.remote.addr + dst_offset,
            self.remote.rkey,
            size as u32,
            dst_offset,
        )
    }

    fn signal(&self) -> Result<()> {
        let next = self.signal_seq.fetch_add(1, Ordering::AcqRel) + 1;
        // SAFETY: signal_cell names a live registered 8-byte cell. The
        // NIC may read it any time before completion; a newer, larger
        // value is benign because the peer waits for "at least".
        unsafe {
            std::ptr::write_volatile(self.signal_cell.addr as *mut u64, next);
        }
        self.post_write(
            self.signal_cell.addr,
            self.signal_cell.lkey,
            self.remote.semaphore_addr,
            self.remote.semaphore_rkey,
            std::mem::size_of::<u64>() as u32,
            u64::MAX,
        )
    }

    /// Drain the CQ until every posted work request has completed, with
    /// tiered backoff and a hard timeout.
    fn flush(&self) -> Result<()> {
        let start = std::time::Instant::now();
        let mut iter = 0u32;
        while self.outstanding.load(Ordering::Acquire) > 0 {
            unsafe {
                let mut wc = ibverbs_sys::ibv_wc::default();
                let ctx = (*self.send_cq).context;
                let ops = &mut (*ctx).ops;
                let n = ops.poll_cq.as_mut().expect("poll_cq missing")(
                    self.send_cq,
                    1,
                    &mut wc as *mut _,
                );
                if n < 0 {
                    return Err(TrigonError::transport(self.conn_id, "poll_cq failed"));
                }
                if n > 0 {
                    if let Some((status, vendor_err)) = wc.error() {
                        return Err(TrigonError::transport(
                            self.conn_id,
                            format!(
                                "work completion failed (status={status:?}, \
                                 vendor_err={vendor_err}, wr_id={})",
                                wc.wr_id()
                            ),
                        ));
                    }
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
            }
            if start.elapsed() > CQ_POLL_TIMEOUT {
                return Err(TrigonError::transport(
                    self.conn_id,
                    format!(
                        "CQ drain timed out after {}ms with {} outstanding",
                        CQ_POLL_TIMEOUT.as_millis(),
                        self.outstanding.load(Ordering::Acquire)
                    ),
                ));
            }
            if iter < 1000 {
                std::hint::spin_loop();
            } else if iter < 5000 {
                std::thread::sleep(std::time::Duration::from_micros(10));
            } else {
                std::thread::sleep(std::time::Duration::from_micros(100));
            }
            iter = iter.saturating_add(1);
        }
        Ok(())
    }
}

impl Drop for IbConnection {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            // CQ owned per-connection; destroy after the QP.
            if !self.send_cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.send_cq);
            }
        }
    }
}
