//! Receive descriptors for inbound iSER PDUs.

use bytes::Bytes;

use super::protocol::encode_recv_wr_id;
use crate::drivers::rdma::verbs::{RecvRequest, Sge};

/// Fixed ring of receive buffers carved out of one allocation.
///
/// Buffer `i` is posted under `encode_recv_wr_id(i)` and is only read after
/// its receive completion has been reaped.
pub(crate) struct RecvRing {
    slot_len: usize,
    depth: usize,
    lkey: u32,
    base_ptr: usize,
    // Written by the device through `base_ptr`; never borrowed directly.
    _backing_mem: Vec<u8>,
}

impl RecvRing {
    pub fn new(depth: usize, slot_len: usize, lkey: u32) -> Self {
        let mut backing = vec![0u8; depth * slot_len];
        let base_ptr = backing.as_mut_ptr() as usize;
        Self {
            slot_len,
            depth,
            lkey,
            base_ptr,
            _backing_mem: backing,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn request(&self, index: u32) -> Option<RecvRequest> {
        if index as usize >= self.depth {
            return None;
        }
        Some(RecvRequest {
            wr_id: encode_recv_wr_id(index),
            sge: Sge {
                addr: (self.base_ptr + index as usize * self.slot_len) as u64,
                length: self.slot_len as u32,
                lkey: self.lkey,
            },
        })
    }

    pub fn requests(&self) -> Vec<RecvRequest> {
        (0..self.depth as u32).filter_map(|i| self.request(i)).collect()
    }

    /// Copy out the first `len` bytes the device wrote into slot `index`.
    pub fn copy_frame(&self, index: u32, len: usize) -> Option<Bytes> {
        if index as usize >= self.depth || len > self.slot_len {
            return None;
        }
        let start = self.base_ptr + index as usize * self.slot_len;
        // SAFETY: the slot lies inside `_backing_mem`, which lives as long as
        // `self`. The slot is not posted while its completion is being
        // handled, so the device is not writing to it concurrently, and the
        // completion queue lock orders the device's writes before this read.
        let frame = unsafe { std::slice::from_raw_parts(start as *const u8, len) };
        Some(Bytes::copy_from_slice(frame))
    }
}
