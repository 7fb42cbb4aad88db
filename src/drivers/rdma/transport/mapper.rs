//! Turns a command's buffers into an ordered work-request chain.
//!
//! A chain is laid out as
//! `[invalidate, registration]* rdma_op* [response send]`.
//! Invalidates are unsignaled and carry the fast-reg sentinel id; everything
//! else is signaled so the command completes only after each piece does.
//! A protected command registers its data and protection regions before the
//! signature region that binds them.

use bytes::Bytes;
use std::sync::Arc;

use super::command::{
    CommandTransferContext, Direction, ProtectionCheck, ProtectionOp, ProtectionRequest,
    TransferRequest,
};
use super::protocol::{encode_cmd_wr_id, ISER_FASTREG_LI_WRID};
use crate::drivers::rdma::context::DeviceCaps;
use crate::drivers::rdma::verbs::{
    AccessFlags, MrHandle, Sge, SignatureAttrs, WorkRequest, WorkRequestOp,
};
use crate::error::{IserError, IserResult};
use crate::memory::{DataBuf, RegistrationDescriptor, RegistrationPool, RemoteRegion};

/// Whether a command must go through a registration descriptor.
pub fn registration_needed(
    pi_support: bool,
    op: ProtectionOp,
    direction: Direction,
    register_reads: bool,
) -> bool {
    (pi_support && op != ProtectionOp::Normal) || (direction == Direction::Read && register_reads)
}

/// Hands out wr_ids for one command's chain.
struct ChainIds {
    seq: u64,
    next: u32,
}

impl ChainIds {
    fn new(seq: u64) -> Self {
        Self { seq, next: 0 }
    }

    fn next(&mut self) -> IserResult<u64> {
        let index = u16::try_from(self.next)
            .map_err(|_| IserError::InvalidInput("work-request chain too long".to_string()))?;
        self.next += 1;
        Ok(encode_cmd_wr_id(self.seq, index))
    }
}

fn local_invalidate(rkey: u32) -> WorkRequest {
    WorkRequest {
        wr_id: ISER_FASTREG_LI_WRID,
        signaled: false,
        op: WorkRequestOp::LocalInvalidate { rkey },
    }
}

fn access_for(direction: Direction) -> AccessFlags {
    match direction {
        Direction::Write => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
        Direction::Read => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
    }
}

fn sge_len(len: u64) -> IserResult<u32> {
    u32::try_from(len)
        .map_err(|_| IserError::InvalidInput(format!("{} bytes exceed one registration", len)))
}

fn check_admission(buf: &DataBuf, caps: &DeviceCaps) -> IserResult<()> {
    if buf.dma_nents() > caps.max_registration_pages {
        return Err(IserError::BufferTooLarge {
            entries: buf.dma_nents(),
            max: caps.max_registration_pages,
        });
    }
    Ok(())
}

/// Build the chain for one command.
///
/// Takes a registration descriptor from `pool` when
/// [`registration_needed`] says so; the descriptor rides in the returned
/// context and goes back to the pool when the context is dropped.
pub fn map_command(
    caps: &DeviceCaps,
    pool: Option<&Arc<RegistrationPool>>,
    pi_support: bool,
    seq: u64,
    req: TransferRequest,
) -> IserResult<CommandTransferContext> {
    let op = req.protection_op();
    let TransferRequest {
        tag,
        direction,
        data,
        protection,
        remote,
        response,
    } = req;

    if data.direction() != direction.dma_direction() {
        return Err(IserError::InvalidInput(format!(
            "{:?} transfer over a {:?} mapping",
            direction,
            data.direction()
        )));
    }
    if !remote.covers(0, data.len()) {
        return Err(IserError::InvalidInput(format!(
            "remote region of {} bytes cannot hold {} bytes",
            remote.len(),
            data.len()
        )));
    }
    check_admission(&data, caps)?;

    let protection = match protection {
        Some(p) if p.op != ProtectionOp::Normal => {
            if !pi_support {
                return Err(IserError::InvalidInput(
                    "protection offload not negotiated on this connection".to_string(),
                ));
            }
            if p.block_size == 0 {
                return Err(IserError::InvalidInput("zero protection block size".to_string()));
            }
            match &p.buf {
                Some(buf) => check_admission(buf, caps)?,
                None if p.op.mem_protected() => {
                    return Err(IserError::InvalidInput(format!(
                        "{:?} needs a protection buffer",
                        p.op
                    )))
                }
                None => {}
            }
            Some(p)
        }
        _ => None,
    };

    let mut ctx = CommandTransferContext::new(tag, seq, direction, data);
    let mut ids = ChainIds::new(seq);

    if !ctx.data.is_empty() {
        let mut lkey = caps.local_dma_lkey;
        if registration_needed(pi_support, op, direction, caps.requires_read_registration) {
            let pool = pool.ok_or(IserError::ResourceExhausted("registration descriptors"))?;
            let mut lease = pool.acquire()?;
            lkey = match protection {
                Some(p) => register_signature(&mut ctx, &mut lease, p, &mut ids)?,
                None => register_data(&mut ctx, &mut lease, &mut ids)?,
            };
            ctx.lease = Some(lease);
        }
        chain_rdma(&mut ctx, caps, lkey, remote, &mut ids)?;
    }

    if let Some(pdu) = response {
        chain_send(&mut ctx, pdu, caps.local_dma_lkey, &mut ids)?;
    }
    Ok(ctx)
}

/// Chain for a standalone control PDU.
pub fn map_send(
    caps: &DeviceCaps,
    seq: u64,
    tag: u32,
    pdu: Bytes,
) -> IserResult<CommandTransferContext> {
    let mut ctx = CommandTransferContext::new(
        tag,
        seq,
        Direction::Write,
        DataBuf::empty(Direction::Write.dma_direction()),
    );
    chain_send(&mut ctx, pdu, caps.local_dma_lkey, &mut ChainIds::new(seq))?;
    Ok(ctx)
}

/// Address range one fast registration maps.
#[derive(Debug, Clone, Copy)]
struct RegionSpan {
    iova: u64,
    length: u64,
    pages: usize,
}

impl RegionSpan {
    fn of(buf: &DataBuf) -> Self {
        Self {
            iova: buf.base_addr(),
            length: buf.len(),
            pages: buf.dma_nents(),
        }
    }
}

/// Chain `[invalidate] register` for `mr`, rotating its key.
fn fast_reg(
    ctx: &mut CommandTransferContext,
    mr: &mut MrHandle,
    valid: &mut bool,
    span: RegionSpan,
    access: AccessFlags,
    ids: &mut ChainIds,
) -> IserResult<()> {
    sge_len(span.length)?;
    let wr_id = ids.next()?;
    if *valid {
        ctx.chain_wr(local_invalidate(mr.rkey));
    }
    mr.inc_key();
    ctx.chain_wr(WorkRequest {
        wr_id,
        signaled: true,
        op: WorkRequestOp::RegisterMr {
            mr: *mr,
            iova: span.iova,
            length: span.length,
            pages: span.pages,
            access,
        },
    });
    *valid = true;
    Ok(())
}

fn register_data(
    ctx: &mut CommandTransferContext,
    desc: &mut RegistrationDescriptor,
    ids: &mut ChainIds,
) -> IserResult<u32> {
    let span = RegionSpan::of(&ctx.data);
    let access = access_for(ctx.direction);
    fast_reg(ctx, &mut desc.data_mr, &mut desc.data_valid, span, access, ids)?;
    desc.sig_protected = false;
    ctx.data_reg_offset = ctx.data.sg_offset();
    Ok(desc.data_mr.lkey)
}

/// Register data and protection locally, then bind both under the
/// signature region the remote side addresses.
fn register_signature(
    ctx: &mut CommandTransferContext,
    desc: &mut RegistrationDescriptor,
    p: ProtectionRequest,
    ids: &mut ChainIds,
) -> IserResult<u32> {
    let (Some(mut sig_mr), Some(mut prot_mr)) = (desc.sig_mr, desc.prot_mr) else {
        return Err(IserError::Verbs(
            "registration descriptor lacks signature regions".to_string(),
        ));
    };

    let data_span = RegionSpan::of(&ctx.data);
    let data_len = sge_len(data_span.length)?;
    fast_reg(
        ctx,
        &mut desc.data_mr,
        &mut desc.data_valid,
        data_span,
        AccessFlags::LOCAL_WRITE,
        ids,
    )?;

    let prot_sge = match &p.buf {
        Some(buf) => {
            let span = RegionSpan::of(buf);
            let length = sge_len(span.length)?;
            fast_reg(
                ctx,
                &mut prot_mr,
                &mut desc.prot_valid,
                span,
                AccessFlags::LOCAL_WRITE,
                ids,
            )?;
            desc.prot_mr = Some(prot_mr);
            Some(Sge {
                addr: span.iova,
                length,
                lkey: prot_mr.lkey,
            })
        }
        None => None,
    };

    let ref_tag_offset = ctx.data.offset() / p.block_size as u64;
    let attrs = SignatureAttrs {
        block_size: p.block_size,
        ref_tag: p.initial_ref_tag.wrapping_add(ref_tag_offset as u32),
        mem_protected: p.op.mem_protected(),
        wire_protected: p.op.wire_protected(),
    };
    let wr_id = ids.next()?;
    if desc.sig_valid {
        ctx.chain_wr(local_invalidate(sig_mr.rkey));
    }
    sig_mr.inc_key();
    ctx.chain_wr(WorkRequest {
        wr_id,
        signaled: true,
        op: WorkRequestOp::RegisterSignature {
            sig_mr,
            data: Sge {
                addr: data_span.iova,
                length: data_len,
                lkey: desc.data_mr.lkey,
            },
            prot: prot_sge,
            attrs,
            access: access_for(ctx.direction),
        },
    });
    desc.sig_mr = Some(sig_mr);
    desc.sig_valid = true;
    desc.sig_protected = true;

    ctx.data_reg_offset = ctx.data.sg_offset();
    ctx.prot_reg_offset = p.buf.as_ref().map_or(0, |b| b.sg_offset());
    ctx.ref_tag_offset = ref_tag_offset;
    ctx.prot = p.buf;
    ctx.protection = Some(ProtectionCheck {
        attrs,
        initial_ref_tag: p.initial_ref_tag,
    });
    Ok(sig_mr.lkey)
}

/// Split the data entries into RDMA operations of at most the device's
/// per-operation scatter limit, addressing consecutive remote bytes.
fn chain_rdma(
    ctx: &mut CommandTransferContext,
    caps: &DeviceCaps,
    lkey: u32,
    remote: RemoteRegion,
    ids: &mut ChainIds,
) -> IserResult<()> {
    let limit = match ctx.direction {
        Direction::Write => caps.max_send_sge,
        Direction::Read => caps.max_read_sge,
    }
    .max(1);
    ctx.nsge_per_rdma = limit;

    let groups: Vec<Vec<Sge>> = ctx
        .data
        .entries()
        .chunks(limit)
        .map(|group| {
            group
                .iter()
                .map(|e| Sge {
                    addr: e.dma_addr,
                    length: e.length,
                    lkey,
                })
                .collect()
        })
        .collect();

    let mut remote = remote;
    for sges in groups {
        let len: u64 = sges.iter().map(|s| s.length as u64).sum();
        let slice = remote.take_first(len);
        let op = match ctx.direction {
            Direction::Write => WorkRequestOp::RdmaWrite {
                sges,
                remote_addr: slice.va(),
                rkey: slice.stag(),
            },
            Direction::Read => WorkRequestOp::RdmaRead {
                sges,
                remote_addr: slice.va(),
                rkey: slice.stag(),
            },
        };
        ctx.chain_wr(WorkRequest {
            wr_id: ids.next()?,
            signaled: true,
            op,
        });
        ctx.nrdmas += 1;
    }
    Ok(())
}

fn chain_send(
    ctx: &mut CommandTransferContext,
    pdu: Bytes,
    lkey: u32,
    ids: &mut ChainIds,
) -> IserResult<()> {
    let buf: Box<[u8]> = pdu.to_vec().into_boxed_slice();
    let sge = Sge {
        addr: buf.as_ptr() as u64,
        length: sge_len(buf.len() as u64)?,
        lkey,
    };
    ctx.tx_buf = Some(buf);
    ctx.chain_wr(WorkRequest {
        wr_id: ids.next()?,
        signaled: true,
        op: WorkRequestOp::Send { sges: vec![sge] },
    });
    Ok(())
}
