//! Hardware queue primitives consumed by the transfer engine.
//!
//! The engine only sees these traits. A provider implements them on top of a
//! verbs library or, as [`super::soft`] does, in software.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::error::{IserError, IserResult};

/// Callback fired when an armed completion queue receives an entry.
pub type CqNotifier = Arc<dyn Fn() + Send + Sync>;

/// One scatter/gather element of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MrKind {
    /// Fast-registration region for data pages.
    Data,
    /// Fast-registration region for protection information.
    Protection,
    /// Signature region binding data and protection domains.
    Signature,
}

/// Handle to a hardware memory region.
///
/// `lkey`/`rkey` carry an 8-bit consumer key in their low byte that is bumped
/// on every re-registration so stale remote keys stop matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle {
    pub id: u32,
    pub lkey: u32,
    pub rkey: u32,
    pub kind: MrKind,
    pub max_pages: usize,
}

impl MrHandle {
    /// Rotate the consumer key byte of both keys.
    pub fn inc_key(&mut self) {
        let key = (self.rkey as u8).wrapping_add(1) as u32;
        self.lkey = (self.lkey & !0xff) | key;
        self.rkey = (self.rkey & !0xff) | key;
    }
}

/// Memory region access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1 << 0);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);

    #[inline]
    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Where protection information is present for a signature registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureAttrs {
    /// Logical block size the guard covers.
    pub block_size: u32,
    /// Reference tag of the first block.
    pub ref_tag: u32,
    /// Protection information lives in local memory.
    pub mem_protected: bool,
    /// Protection information travels on the wire.
    pub wire_protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkRequestOp {
    Send {
        sges: Vec<Sge>,
    },
    RdmaWrite {
        sges: Vec<Sge>,
        remote_addr: u64,
        rkey: u32,
    },
    RdmaRead {
        sges: Vec<Sge>,
        remote_addr: u64,
        rkey: u32,
    },
    LocalInvalidate {
        rkey: u32,
    },
    RegisterMr {
        mr: MrHandle,
        iova: u64,
        length: u64,
        pages: usize,
        access: AccessFlags,
    },
    RegisterSignature {
        sig_mr: MrHandle,
        data: Sge,
        prot: Option<Sge>,
        attrs: SignatureAttrs,
        access: AccessFlags,
    },
}

/// A send-queue work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub wr_id: u64,
    pub signaled: bool,
    pub op: WorkRequestOp,
}

impl WorkRequest {
    pub fn opcode(&self) -> WcOpcode {
        match self.op {
            WorkRequestOp::Send { .. } => WcOpcode::Send,
            WorkRequestOp::RdmaWrite { .. } => WcOpcode::RdmaWrite,
            WorkRequestOp::RdmaRead { .. } => WcOpcode::RdmaRead,
            WorkRequestOp::LocalInvalidate { .. } => WcOpcode::LocalInvalidate,
            WorkRequestOp::RegisterMr { .. } | WorkRequestOp::RegisterSignature { .. } => {
                WcOpcode::RegisterMr
            }
        }
    }

    /// Scatter entries carried by a data-moving request.
    pub fn sges(&self) -> &[Sge] {
        match &self.op {
            WorkRequestOp::Send { sges }
            | WorkRequestOp::RdmaWrite { sges, .. }
            | WorkRequestOp::RdmaRead { sges, .. } => sges,
            _ => &[],
        }
    }

    /// Bytes moved by this request.
    pub fn byte_len(&self) -> u64 {
        self.sges().iter().map(|s| s.length as u64).sum()
    }
}

/// A receive-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WrFlushError,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceeded,
    GeneralError,
}

impl WcStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }

    /// Flush errors are the echo of a queue pair entering Error, not a root cause.
    #[inline]
    pub fn is_flush(self) -> bool {
        self == WcStatus::WrFlushError
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    LocalInvalidate,
    RegisterMr,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub qp_num: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Infiniband,
    Roce,
    Iwarp,
}

/// Subset of device attributes the engine sizes itself from.
#[derive(Debug, Clone)]
pub struct DeviceAttributes {
    pub max_sge: usize,
    pub max_sge_rd: usize,
    pub max_fast_reg_page_list_len: usize,
    pub max_qp_wr: usize,
    pub max_cqe: usize,
    pub num_comp_vectors: usize,
    pub signature_handover: bool,
    pub transport: TransportKind,
    pub local_dma_lkey: u32,
}

impl Default for DeviceAttributes {
    fn default() -> Self {
        Self {
            max_sge: 32,
            max_sge_rd: 30,
            max_fast_reg_page_list_len: 512,
            max_qp_wr: 16384,
            max_cqe: 65536,
            num_comp_vectors: 4,
            signature_handover: false,
            transport: TransportKind::Infiniband,
            local_dma_lkey: 0x100,
        }
    }
}

/// Queue pair sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub max_send_wr: usize,
    pub max_recv_wr: usize,
    pub max_send_sge: usize,
    pub max_recv_sge: usize,
    pub signature_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureErrorKind {
    Guard,
    ReferenceTag,
    ApplicationTag,
}

/// Signature check failure reported by the device after a protected transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureError {
    pub kind: SignatureErrorKind,
    /// Byte offset of the failing block within the protected range.
    pub offset: u64,
}

/// A rejected post. Requests before `index` were accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFailure {
    pub index: usize,
    pub reason: String,
}

impl fmt::Display for PostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "post rejected at index {}: {}", self.index, self.reason)
    }
}

impl From<PostFailure> for IserError {
    fn from(e: PostFailure) -> Self {
        IserError::Verbs(e.to_string())
    }
}

pub trait CompletionQueue: Send + Sync {
    fn id(&self) -> u32;

    /// Move up to `max` completions into `out`, returning how many were taken.
    fn poll(&self, out: &mut Vec<WorkCompletion>, max: usize) -> usize;

    /// Arm the notifier for the next completion.
    ///
    /// Returns `true` if completions were already queued, in which case the
    /// caller must poll again instead of waiting.
    fn req_notify(&self) -> bool;
}

pub trait QueuePair: Send + Sync {
    fn qp_num(&self) -> u32;

    fn state(&self) -> QpState;

    fn modify_to_rts(&self) -> IserResult<()>;

    /// Move to Error. Outstanding requests complete with [`WcStatus::WrFlushError`].
    fn modify_to_error(&self) -> IserResult<()>;

    /// Post a chain in order.
    fn post_send(&self, wrs: &[WorkRequest]) -> Result<(), PostFailure>;

    fn post_recv(&self, wrs: &[RecvRequest]) -> Result<(), PostFailure>;
}

pub trait VerbsDevice: Send + Sync {
    fn name(&self) -> &str;

    fn query_attributes(&self) -> DeviceAttributes;

    fn create_cq(
        &self,
        entries: usize,
        vector: usize,
        notifier: CqNotifier,
    ) -> IserResult<Arc<dyn CompletionQueue>>;

    fn create_qp(
        &self,
        cq: &Arc<dyn CompletionQueue>,
        attr: &QpInitAttr,
    ) -> IserResult<Arc<dyn QueuePair>>;

    /// Destroy a queue pair. Requests still posted are discarded without
    /// completions, so callers drain first.
    fn destroy_qp(&self, qp: &dyn QueuePair) -> IserResult<()>;

    /// Destroy a completion queue. Every queue pair on it must be gone.
    fn destroy_cq(&self, cq: &dyn CompletionQueue) -> IserResult<()>;

    fn alloc_mr(&self, kind: MrKind, max_pages: usize) -> IserResult<MrHandle>;

    fn dealloc_mr(&self, mr: &MrHandle) -> IserResult<()>;

    /// Consult and clear the signature status of a signature region.
    fn check_signature_status(&self, mr: &MrHandle) -> IserResult<Option<SignatureError>>;
}
