//! The 16-byte trigger record shared bit-for-bit between GPU producers
//! and the CPU proxy.
//!
//! A trigger describes one unit of host-side work: a data move, a remote
//! flag signal, a completion flush, or any combination of the three.
//! Kernels write raw words and the proxy decodes them, so the bit
//! positions here are load-bearing and must match the device-side
//! encoder exactly.

use crate::error::{Result, TrigonError};
use crate::types::ConnId;

bitflags::bitflags! {
    /// Opcode mask carried in a trigger's validity word.
    ///
    /// A valid trigger always has at least one bit set; an all-zero mask
    /// is what marks a fifo slot empty.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TriggerType: u64 {
        /// Post a one-sided data write (`put`).
        const DATA = 1 << 0;
        /// Post a remote flag increment (`signal`).
        const FLAG = 1 << 1;
        /// Wait for completion of outstanding posts (`flush`).
        const SYNC = 1 << 2;
    }
}

/// Bits for the transfer size field (validity word, bits 0..32).
pub const SIZE_BITS: u32 = 32;
/// Bits for the connection id field (validity word, bits 32..42).
pub const CONN_ID_BITS: u32 = 10;
/// Bits for the opcode mask (validity word, bits 42..45).
pub const TYPE_BITS: u32 = 3;
/// Bits for each data offset field (payload word).
pub const OFFSET_BITS: u32 = 32;

const SIZE_SHIFT: u32 = 0;
const CONN_ID_SHIFT: u32 = SIZE_BITS;
const TYPE_SHIFT: u32 = SIZE_BITS + CONN_ID_BITS;
const DST_SHIFT: u32 = OFFSET_BITS;

const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const CONN_ID_MASK: u64 = (1 << CONN_ID_BITS) - 1;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// A trigger as it sits in a fifo slot: two 64-bit words, 16-byte
/// aligned.
///
/// `fst` is the validity word: opcode mask, connection id and transfer
/// size. A slot whose `fst` is zero is empty; the producer writes `snd`
/// first and publishes `fst` last, so a half-written slot always reads
/// as empty. `snd` carries the source and destination data offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct RawTrigger {
    pub fst: u64,
    pub snd: u64,
}

const _: () = assert!(std::mem::size_of::<RawTrigger>() == 16);
const _: () = assert!(SIZE_BITS + CONN_ID_BITS + TYPE_BITS <= 64);
const _: () = assert!(2 * OFFSET_BITS <= 64);

impl RawTrigger {
    pub const EMPTY: RawTrigger = RawTrigger { fst: 0, snd: 0 };

    /// True when the validity word is zero (no trigger in this slot).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fst == 0
    }
}

/// Decoded form of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub ty: TriggerType,
    pub conn_id: ConnId,
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

impl Trigger {
    /// Pack into the wire representation, checking field widths.
    pub fn encode(&self) -> Result<RawTrigger> {
        if self.ty.is_empty() {
            return Err(TrigonError::TriggerOverflow {
                field: "type",
                value: 0,
                bits: TYPE_BITS,
            });
        }
        check_width("size", self.size, SIZE_BITS)?;
        check_width("conn_id", self.conn_id as u64, CONN_ID_BITS)?;
        check_width("src_offset", self.src_offset, OFFSET_BITS)?;
        check_width("dst_offset", self.dst_offset, OFFSET_BITS)?;
        Ok(self.encode_unchecked())
    }

    /// Pack without width checks. The producer fast path uses this;
    /// overflow is a caller bug, caught by debug assertions only.
    #[inline]
    pub fn encode_unchecked(&self) -> RawTrigger {
        debug_assert!(!self.ty.is_empty());
        debug_assert!(self.size <= SIZE_MASK);
        debug_assert!((self.conn_id as u64) <= CONN_ID_MASK);
        debug_assert!(self.src_offset <= OFFSET_MASK);
        debug_assert!(self.dst_offset <= OFFSET_MASK);
        RawTrigger {
            fst: (self.size << SIZE_SHIFT)
                | ((self.conn_id as u64) << CONN_ID_SHIFT)
                | (self.ty.bits() << TYPE_SHIFT),
            snd: self.src_offset | (self.dst_offset << DST_SHIFT),
        }
    }

    /// Unpack from the wire representation.
    #[inline]
    pub fn decode(raw: RawTrigger) -> Trigger {
        Trigger {
            ty: TriggerType::from_bits_truncate((raw.fst >> TYPE_SHIFT) & TYPE_MASK),
            conn_id: ((raw.fst >> CONN_ID_SHIFT) & CONN_ID_MASK) as ConnId,
            src_offset: raw.snd & OFFSET_MASK,
            dst_offset: (raw.snd >> DST_SHIFT) & OFFSET_MASK,
            size: (raw.fst >> SIZE_SHIFT) & SIZE_MASK,
        }
    }
}

fn check_width(field: &'static str, value: u64, bits: u32) -> Result<()> {
    if bits < 64 && value >> bits != 0 {
        return Err(TrigonError::TriggerOverflow { field, value, bits });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Trigger {
        Trigger {
            ty: TriggerType::DATA | TriggerType::SYNC,
            conn_id: 5,
            src_offset: 0x100,
            dst_offset: 0x200,
            size: 4096,
        }
    }

    #[test]
    fn test_round_trip() {
        let t = sample();
        let raw = t.encode().unwrap();
        assert_eq!(Trigger::decode(raw), t);
    }

    #[test]
    fn test_valid_trigger_is_nonzero() {
        // Any trigger with a non-empty type mask must have fst != 0 even
        // with all other fields zero; fst == 0 is the empty-slot marker.
        for ty in [TriggerType::DATA, TriggerType::FLAG, TriggerType::SYNC] {
            let t = Trigger {
                ty,
                conn_id: 0,
                src_offset: 0,
                dst_offset: 0,
                size: 0,
            };
            assert!(!t.encode().unwrap().is_empty());
        }
    }

    #[test]
    fn test_empty_raw() {
        assert!(RawTrigger::EMPTY.is_empty());
        assert!(!sample().encode().unwrap().is_empty());
    }

    #[test]
    fn test_type_mask_positions() {
        let raw = sample().encode().unwrap();
        let ty = (raw.fst >> TYPE_SHIFT) & TYPE_MASK;
        assert_eq!(ty, (TriggerType::DATA | TriggerType::SYNC).bits());
    }

    #[test]
    fn test_field_extremes() {
        let t = Trigger {
            ty: TriggerType::all(),
            conn_id: (CONN_ID_MASK) as ConnId,
            src_offset: OFFSET_MASK,
            dst_offset: OFFSET_MASK,
            size: SIZE_MASK,
        };
        let raw = t.encode().unwrap();
        assert_eq!(Trigger::decode(raw), t);
    }

    #[test]
    fn test_size_overflow_rejected() {
        let mut t = sample();
        t.size = SIZE_MASK + 1;
        assert!(matches!(
            t.encode(),
            Err(TrigonError::TriggerOverflow { field: "size", .. })
        ));
    }

    #[test]
    fn test_conn_id_overflow_rejected() {
        let mut t = sample();
        t.conn_id = (CONN_ID_MASK + 1) as ConnId;
        assert!(matches!(
            t.encode(),
            Err(TrigonError::TriggerOverflow {
                field: "conn_id",
                ..
            })
        ));
    }

    #[test]
    fn test_offset_overflow_rejected() {
        let mut t = sample();
        t.dst_offset = OFFSET_MASK + 1;
        assert!(t.encode().is_err());
    }

    #[test]
    fn test_typeless_trigger_rejected() {
        let mut t = sample();
        t.ty = TriggerType::empty();
        assert!(t.encode().is_err());
    }

    #[test]
    fn test_fields_do_not_alias() {
        // Each field decoded from a one-hot encoding must not bleed into
        // its neighbors.
        let t = Trigger {
            ty: TriggerType::FLAG,
            conn_id: 1,
            src_offset: 1,
            dst_offset: 1,
            size: 1,
        };
        let d = Trigger::decode(t.encode().unwrap());
        assert_eq!(d.size, 1);
        assert_eq!(d.conn_id, 1);
        assert_eq!(d.src_offset, 1);
        assert_eq!(d.dst_offset, 1);
        assert_eq!(d.ty, TriggerType::FLAG);
    }
}
