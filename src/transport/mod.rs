//! Host-side transport primitives the proxy drives on behalf of GPU
//! kernels.
//!
//! A connection exposes three synchronous operations; a trigger's opcode
//! mask selects which of them run, always in the same order:
//! data first, then the remote flag, then the completion wait. That
//! fixed order is what makes a combined `DATA|FLAG|SYNC` trigger mean
//! "put, notify the peer, wait until it's all on the wire" in a single
//! 16-byte entry.

pub mod p2p;

#[cfg(feature = "ib")]
pub mod ib;

use crate::error::Result;
use crate::trigger::{Trigger, TriggerType};
use crate::types::TransportType;

/// One established connection to a peer, as the proxy sees it.
///
/// Establishment (bootstrap, QP handshakes, peer memory exchange) is the
/// caller's job; the proxy only executes these three primitives.
pub trait HostConnection: Send + Sync {
    /// Which transport this connection runs on.
    fn transport(&self) -> TransportType;

    /// Enqueue a one-sided write of `size` bytes from the local buffer
    /// at `src_offset` to the peer's buffer at `dst_offset`.
    fn put(&self, dst_offset: u64, src_offset: u64, size: u64) -> Result<()>;

    /// Post a remote flag increment (semaphore bump at the peer).
    fn signal(&self) -> Result<()>;

    /// Block until every operation previously posted on this connection
    /// has completed.
    fn flush(&self) -> Result<()>;
}

/// Execute one decoded trigger against its connection.
pub fn dispatch(trigger: &Trigger, conn: &dyn HostConnection) -> Result<()> {
    if trigger.ty.contains(TriggerType::DATA) {
        conn.put(trigger.dst_offset, trigger.src_offset, trigger.size)?;
    }
    if trigger.ty.contains(TriggerType::FLAG) {
        conn.signal()?;
    }
    if trigger.ty.contains(TriggerType::SYNC) {
        conn.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        ops: Mutex<Vec<String>>,
    }

    impl HostConnection for Recorder {
        fn transport(&self) -> TransportType {
            TransportType::P2p
        }
        fn put(&self, dst: u64, src: u64, size: u64) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("put({dst:#x},{src:#x},{size})"));
            Ok(())
        }
        fn signal(&self) -> Result<()> {
            self.ops.lock().unwrap().push("signal".into());
            Ok(())
        }
        fn flush(&self) -> Result<()> {
            self.ops.lock().unwrap().push("flush".into());
            Ok(())
        }
    }

    fn trig(ty: TriggerType) -> Trigger {
        Trigger {
            ty,
            conn_id: 0,
            src_offset: 0x100,
            dst_offset: 0x200,
            size: 4096,
        }
    }

    #[test]
    fn test_combined_trigger_order() {
        let conn = Recorder::default();
        dispatch(
            &trig(TriggerType::DATA | TriggerType::FLAG | TriggerType::SYNC),
            &conn,
        )
        .unwrap();
        assert_eq!(
            *conn.ops.lock().unwrap(),
            vec!["put(0x200,0x100,4096)", "signal", "flush"]
        );
    }

    #[test]
    fn test_data_only() {
        let conn = Recorder::default();
        dispatch(&trig(TriggerType::DATA), &conn).unwrap();
        assert_eq!(*conn.ops.lock().unwrap(), vec!["put(0x200,0x100,4096)"]);
    }

    #[test]
    fn test_flag_only() {
        let conn = Recorder::default();
        dispatch(&trig(TriggerType::FLAG), &conn).unwrap();
        assert_eq!(*conn.ops.lock().unwrap(), vec!["signal"]);
    }

    #[test]
    fn test_sync_only() {
        let conn = Recorder::default();
        dispatch(&trig(TriggerType::SYNC), &conn).unwrap();
        assert_eq!(*conn.ops.lock().unwrap(), vec!["flush"]);
    }

    struct FailingPut;

    impl HostConnection for FailingPut {
        fn transport(&self) -> TransportType {
            TransportType::Ib
        }
        fn put(&self, _: u64, _: u64, _: u64) -> Result<()> {
            Err(crate::error::TrigonError::transport(0, "qp error"))
        }
        fn signal(&self) -> Result<()> {
            panic!("signal must not run after a failed put");
        }
        fn flush(&self) -> Result<()> {
            panic!("flush must not run after a failed put");
        }
    }

    #[test]
    fn test_error_stops_dispatch() {
        let err = dispatch(
            &trig(TriggerType::DATA | TriggerType::FLAG | TriggerType::SYNC),
            &FailingPut,
        )
        .unwrap_err();
        assert!(err.to_string().contains("qp error"));
    }
}
