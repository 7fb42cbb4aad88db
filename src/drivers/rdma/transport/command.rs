//! Per-command transfer descriptions and state.

use bytes::Bytes;

use crate::drivers::rdma::verbs::{SignatureAttrs, WorkRequest};
use crate::memory::{DataBuf, DmaDirection, RegistrationLease, RemoteRegion};

/// Which way data moves relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Target pushes into initiator memory (SCSI data-in, RDMA write).
    Write,
    /// Target pulls from initiator memory (SCSI data-out, RDMA read).
    Read,
}

impl Direction {
    pub fn dma_direction(self) -> DmaDirection {
        match self {
            Direction::Write => DmaDirection::ToDevice,
            Direction::Read => DmaDirection::FromDevice,
        }
    }
}

/// Protection information handling requested for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionOp {
    Normal,
    /// Generate PI on the wire for data read from unprotected memory.
    DinInsert,
    /// Verify and drop PI from protected memory before it goes on the wire.
    DinStrip,
    DinPass,
    /// Generate PI in memory for unprotected data from the wire.
    DoutInsert,
    /// Verify and drop PI arriving on the wire.
    DoutStrip,
    DoutPass,
}

impl ProtectionOp {
    /// PI is present in local memory.
    pub fn mem_protected(self) -> bool {
        matches!(
            self,
            ProtectionOp::DinStrip
                | ProtectionOp::DoutInsert
                | ProtectionOp::DinPass
                | ProtectionOp::DoutPass
        )
    }

    /// PI travels on the wire.
    pub fn wire_protected(self) -> bool {
        matches!(
            self,
            ProtectionOp::DinInsert
                | ProtectionOp::DoutStrip
                | ProtectionOp::DinPass
                | ProtectionOp::DoutPass
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionRequest {
    pub op: ProtectionOp,
    pub block_size: u32,
    /// Reference tag of block zero of the command.
    pub initial_ref_tag: u32,
    /// Host-side PI buffer, required when PI lives in memory.
    pub buf: Option<DataBuf>,
}

/// One command's data movement as handed down by the command layer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Initiator task tag echoed back in the completion callback.
    pub tag: u32,
    pub direction: Direction,
    pub data: DataBuf,
    pub protection: Option<ProtectionRequest>,
    /// Initiator memory the data slice maps onto.
    pub remote: RemoteRegion,
    /// Response PDU sent after the data in the same chain.
    pub response: Option<Bytes>,
}

impl TransferRequest {
    pub fn new(tag: u32, direction: Direction, data: DataBuf, remote: RemoteRegion) -> Self {
        Self {
            tag,
            direction,
            data,
            protection: None,
            remote,
            response: None,
        }
    }

    pub fn with_protection(mut self, protection: ProtectionRequest) -> Self {
        self.protection = Some(protection);
        self
    }

    pub fn with_response(mut self, pdu: Bytes) -> Self {
        self.response = Some(pdu);
        self
    }

    pub fn protection_op(&self) -> ProtectionOp {
        self.protection.as_ref().map_or(ProtectionOp::Normal, |p| p.op)
    }
}

/// What `submit` posted for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHandle {
    pub tag: u32,
    pub seq: u64,
    /// Work requests in the posted chain, invalidates included.
    pub work_requests: usize,
    /// RDMA read or write operations in the chain.
    pub rdma_ops: usize,
    /// A registration descriptor was taken for this command.
    pub registered: bool,
}

/// Protection parameters kept for the post-completion signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProtectionCheck {
    pub attrs: SignatureAttrs,
    pub initial_ref_tag: u32,
}

/// Everything a command holds between submit and its final completion.
#[derive(Debug)]
pub struct CommandTransferContext {
    pub(crate) tag: u32,
    pub(crate) seq: u64,
    pub(crate) direction: Direction,
    wrs: Vec<WorkRequest>,
    signaled: usize,
    pub(crate) nrdmas: usize,
    pub(crate) nsge_per_rdma: usize,
    pub(crate) data: DataBuf,
    pub(crate) prot: Option<DataBuf>,
    pub(crate) data_reg_offset: u32,
    pub(crate) prot_reg_offset: u32,
    pub(crate) ref_tag_offset: u64,
    pub(crate) protection: Option<ProtectionCheck>,
    pub(crate) lease: Option<RegistrationLease>,
    /// Owns the response bytes the trailing send points at.
    pub(crate) tx_buf: Option<Box<[u8]>>,
}

impl CommandTransferContext {
    pub(crate) fn new(tag: u32, seq: u64, direction: Direction, data: DataBuf) -> Self {
        Self {
            tag,
            seq,
            direction,
            wrs: Vec::new(),
            signaled: 0,
            nrdmas: 0,
            nsge_per_rdma: 0,
            data,
            prot: None,
            data_reg_offset: 0,
            prot_reg_offset: 0,
            ref_tag_offset: 0,
            protection: None,
            lease: None,
            tx_buf: None,
        }
    }

    /// Append to the chain. The first request appended becomes its head.
    pub(crate) fn chain_wr(&mut self, wr: WorkRequest) {
        if wr.signaled {
            self.signaled += 1;
        }
        self.wrs.push(wr);
    }

    pub fn first_wr(&self) -> Option<&WorkRequest> {
        self.wrs.first()
    }

    pub fn last_wr(&self) -> Option<&WorkRequest> {
        self.wrs.last()
    }

    pub fn work_requests(&self) -> &[WorkRequest] {
        &self.wrs
    }

    /// Completions the command waits for.
    pub fn signaled_count(&self) -> usize {
        self.signaled
    }

    pub fn is_empty(&self) -> bool {
        self.wrs.is_empty()
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn rdma_ops(&self) -> usize {
        self.nrdmas
    }

    pub fn data(&self) -> &DataBuf {
        &self.data
    }

    pub fn data_registration_offset(&self) -> u32 {
        self.data_reg_offset
    }

    pub fn protection_registration_offset(&self) -> u32 {
        self.prot_reg_offset
    }

    pub fn reference_tag_offset(&self) -> u64 {
        self.ref_tag_offset
    }

    pub fn is_registered(&self) -> bool {
        self.lease.is_some()
    }

    pub fn handle(&self) -> TransferHandle {
        TransferHandle {
            tag: self.tag,
            seq: self.seq,
            work_requests: self.wrs.len(),
            rdma_ops: self.nrdmas,
            registered: self.lease.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::rdma::verbs::WorkRequestOp;

    #[test]
    fn test_protection_domains() {
        assert!(!ProtectionOp::Normal.mem_protected());
        assert!(!ProtectionOp::Normal.wire_protected());
        assert!(ProtectionOp::DinInsert.wire_protected());
        assert!(!ProtectionOp::DinInsert.mem_protected());
        assert!(ProtectionOp::DoutInsert.mem_protected());
        assert!(!ProtectionOp::DoutInsert.wire_protected());
        assert!(ProtectionOp::DoutPass.mem_protected() && ProtectionOp::DoutPass.wire_protected());
    }

    #[test]
    fn test_chain_head_and_tail() {
        let mut ctx = CommandTransferContext::new(
            1,
            9,
            Direction::Write,
            DataBuf::empty(DmaDirection::ToDevice),
        );
        assert!(ctx.first_wr().is_none());
        for (i, signaled) in [(1u64, false), (2, true), (3, true)] {
            ctx.chain_wr(WorkRequest {
                wr_id: i,
                signaled,
                op: WorkRequestOp::LocalInvalidate { rkey: 0 },
            });
        }
        assert_eq!(ctx.first_wr().map(|w| w.wr_id), Some(1));
        assert_eq!(ctx.last_wr().map(|w| w.wr_id), Some(3));
        assert_eq!(ctx.signaled_count(), 2);
        assert_eq!(ctx.handle().work_requests, 3);
    }
}
