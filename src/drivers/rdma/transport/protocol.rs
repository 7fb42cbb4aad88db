//! Protocol constants and work-request id encoding.
//!
//! Every wr_id posted by a connection is tagged so a completion can be routed
//! without a lookup on the hot path:
//! - top two bits select the kind
//! - command ids carry the command sequence in bits 16..62 and the chain index below
//! - receive ids carry the descriptor index
//! - two all-ones sentinels mark unsignaled invalidates and the drain beacon

/// Largest scatter list a single registration may cover.
pub const ISCSI_ISER_SG_TABLESIZE: usize = 256;

/// Upper bound on completion queues per device.
pub const ISERT_MAX_CQ: usize = 64;

/// Default command queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Default receive queue depth.
pub const DEFAULT_RECV_DEPTH: usize = 512;

/// Unsignaled local invalidate preceding a re-registration.
pub const ISER_FASTREG_LI_WRID: u64 = 0xffff_ffff_ffff_ffff;

/// Drain barrier receive posted after the queue pair enters Error.
pub const ISER_BEACON_WRID: u64 = 0xffff_ffff_ffff_fffe;

pub const WRID_KIND_SHIFT: u32 = 62;
pub const WRID_KIND_MASK: u64 = 0b11 << WRID_KIND_SHIFT;
pub const WRID_KIND_CMD: u64 = 0b00 << WRID_KIND_SHIFT;
pub const WRID_KIND_RECV: u64 = 0b01 << WRID_KIND_SHIFT;
pub const WRID_INDEX_BITS: u32 = 16;
pub const WRID_INDEX_MASK: u64 = (1 << WRID_INDEX_BITS) - 1;
pub const WRID_SEQ_MASK: u64 = !WRID_KIND_MASK >> WRID_INDEX_BITS;

/// Decoded work-request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrKind {
    Command { seq: u64, index: u16 },
    Recv { index: u32 },
    FastRegInvalidate,
    Beacon,
    Unknown(u64),
}

/// Encode the id of work request `index` in command `seq`'s chain.
#[inline]
pub fn encode_cmd_wr_id(seq: u64, index: u16) -> u64 {
    WRID_KIND_CMD | ((seq & WRID_SEQ_MASK) << WRID_INDEX_BITS) | index as u64
}

#[inline]
pub fn encode_recv_wr_id(index: u32) -> u64 {
    WRID_KIND_RECV | index as u64
}

#[inline]
pub fn decode_wr_id(wr_id: u64) -> WrKind {
    match wr_id {
        ISER_FASTREG_LI_WRID => WrKind::FastRegInvalidate,
        ISER_BEACON_WRID => WrKind::Beacon,
        _ => match wr_id & WRID_KIND_MASK {
            WRID_KIND_CMD => WrKind::Command {
                seq: (wr_id >> WRID_INDEX_BITS) & WRID_SEQ_MASK,
                index: (wr_id & WRID_INDEX_MASK) as u16,
            },
            WRID_KIND_RECV => WrKind::Recv {
                index: (wr_id & 0xffff_ffff) as u32,
            },
            _ => WrKind::Unknown(wr_id),
        },
    }
}
