//! iSER wire framing.
//!
//! A message on the send/receive queues is an iSER header, the 48-byte iSCSI
//! basic header segment and optional inline data. All header fields are
//! big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{IserError, IserResult};
use crate::memory::RemoteRegion;

/// Length of the iSER header.
pub const ISER_HEADER_LEN: usize = 28;

/// Length of the iSCSI basic header segment.
pub const ISCSI_BHS_LEN: usize = 48;

/// Combined header length preceding inline data.
pub const ISER_HEADERS_LEN: usize = ISER_HEADER_LEN + ISCSI_BHS_LEN;

/// Default inline data segment carried by one receive descriptor.
pub const DEFAULT_RECV_DATA_LEN: usize = 8192;

pub const ISCSI_CTRL: u8 = 0x10;
pub const ISER_HELLO: u8 = 0x20;
pub const ISER_HELLORPLY: u8 = 0x30;
pub const ISER_WSV: u8 = 0x08;
pub const ISER_RSV: u8 = 0x04;

const OPCODE_MASK: u8 = 0xf0;

/// Validates that the frame length does not exceed the maximum allowed size.
pub fn validate_frame_len(len: usize, max_len: usize) -> IserResult<()> {
    if len > max_len {
        return Err(IserError::InvalidInput(format!(
            "message length {} exceeds maximum allowed size {}",
            len, max_len
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IserHeader {
    pub flags: u8,
    pub write_stag: u32,
    pub write_va: u64,
    pub read_stag: u32,
    pub read_va: u64,
}

impl IserHeader {
    /// Control-type header with no advertised regions.
    pub fn control() -> Self {
        Self {
            flags: ISCSI_CTRL,
            ..Default::default()
        }
    }

    pub fn is_control(&self) -> bool {
        self.flags & OPCODE_MASK == ISCSI_CTRL
    }

    /// Initiator buffer the target may RDMA-read from, if advertised.
    pub fn write_region(&self, len: u64) -> Option<RemoteRegion> {
        (self.flags & ISER_WSV != 0).then(|| RemoteRegion::new(self.write_stag, self.write_va, len))
    }

    /// Initiator buffer the target may RDMA-write into, if advertised.
    pub fn read_region(&self, len: u64) -> Option<RemoteRegion> {
        (self.flags & ISER_RSV != 0).then(|| RemoteRegion::new(self.read_stag, self.read_va, len))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(ISER_HEADER_LEN);
        buf.put_u8(self.flags);
        buf.put_bytes(0, 3);
        buf.put_u32(self.write_stag);
        buf.put_u64(self.write_va);
        buf.put_u32(self.read_stag);
        buf.put_u64(self.read_va);
    }

    pub fn decode(mut buf: &[u8]) -> IserResult<Self> {
        if buf.len() < ISER_HEADER_LEN {
            return Err(IserError::InvalidInput(format!(
                "iser header truncated: {} bytes",
                buf.len()
            )));
        }
        let flags = buf.get_u8();
        buf.advance(3);
        Ok(Self {
            flags,
            write_stag: buf.get_u32(),
            write_va: buf.get_u64(),
            read_stag: buf.get_u32(),
            read_va: buf.get_u64(),
        })
    }
}

/// A received or outgoing iSER message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IserPdu {
    pub header: IserHeader,
    pub bhs: Bytes,
    pub data: Bytes,
}

impl IserPdu {
    pub fn new(header: IserHeader, bhs: [u8; ISCSI_BHS_LEN], data: Bytes) -> Self {
        Self {
            header,
            bhs: Bytes::copy_from_slice(&bhs),
            data,
        }
    }

    /// iSCSI opcode without the immediate bit.
    pub fn opcode(&self) -> u8 {
        self.bhs[0] & 0x3f
    }

    /// Initiator task tag.
    pub fn itt(&self) -> u32 {
        u32::from_be_bytes([self.bhs[16], self.bhs[17], self.bhs[18], self.bhs[19]])
    }

    /// 24-bit data segment length from the basic header.
    pub fn data_segment_len(&self) -> u32 {
        u32::from_be_bytes([0, self.bhs[5], self.bhs[6], self.bhs[7]])
    }

    pub fn encoded_len(&self) -> usize {
        ISER_HEADERS_LEN + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.bhs);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse one received message. Inline data above `max_data` is rejected.
    pub fn decode(frame: Bytes, max_data: usize) -> IserResult<Self> {
        if frame.len() < ISER_HEADERS_LEN {
            return Err(IserError::InvalidInput(format!(
                "frame of {} bytes shorter than iser headers",
                frame.len()
            )));
        }
        validate_frame_len(frame.len() - ISER_HEADERS_LEN, max_data)?;
        let header = IserHeader::decode(&frame[..ISER_HEADER_LEN])?;
        Ok(Self {
            header,
            bhs: frame.slice(ISER_HEADER_LEN..ISER_HEADERS_LEN),
            data: frame.slice(ISER_HEADERS_LEN..),
        })
    }
}
