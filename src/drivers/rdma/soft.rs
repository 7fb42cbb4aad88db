//! Software verbs provider.
//!
//! Executes work requests in order on the posting thread and reports
//! completions through the same notify/poll protocol a hardware completion
//! queue uses. Remote memory is not modeled: RDMA reads and writes are only
//! validated and logged. Used by the test suite and the loopback demo.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::verbs::{
    CompletionQueue, CqNotifier, DeviceAttributes, MrHandle, MrKind, PostFailure, QpInitAttr,
    QpState, QueuePair, RecvRequest, SignatureError, VerbsDevice, WcOpcode, WcStatus,
    WorkCompletion, WorkRequest, WorkRequestOp,
};
use crate::error::{IserError, IserResult};

/// Record of a send-queue request the device executed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedWr {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub remote_addr: Option<u64>,
    pub rkey: Option<u32>,
    pub bytes: u64,
    pub sge_count: usize,
}

pub struct SoftCq {
    id: u32,
    capacity: usize,
    entries: Mutex<VecDeque<WorkCompletion>>,
    armed: AtomicBool,
    notifier: CqNotifier,
}

impl SoftCq {
    fn push(&self, wc: WorkCompletion) {
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity {
                debug!(cq = self.id, "soft cq overrun, dropping oldest entry");
                entries.pop_front();
            }
            entries.push_back(wc);
        }
        if self.armed.swap(false, Ordering::AcqRel) {
            (self.notifier)();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CompletionQueue for SoftCq {
    fn id(&self) -> u32 {
        self.id
    }

    fn poll(&self, out: &mut Vec<WorkCompletion>, max: usize) -> usize {
        let mut entries = self.entries.lock();
        let n = max.min(entries.len());
        out.extend(entries.drain(..n));
        n
    }

    fn req_notify(&self) -> bool {
        self.armed.store(true, Ordering::Release);
        !self.entries.lock().is_empty()
    }
}

struct SoftQpInner {
    state: QpState,
    auto_complete: bool,
    // Error transitions leave held sends queued until `complete_pending`.
    defer_send_flush: bool,
    pending: VecDeque<WorkRequest>,
    recvs: VecDeque<RecvRequest>,
    faults: VecDeque<(WcOpcode, WcStatus)>,
    log: Vec<ExecutedWr>,
}

pub struct SoftQueuePair {
    qp_num: u32,
    cq: Arc<SoftCq>,
    attr: QpInitAttr,
    max_sge_rd: usize,
    inner: Mutex<SoftQpInner>,
}

impl SoftQueuePair {
    fn complete(&self, wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: u32) {
        self.cq.push(WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num: self.qp_num,
        });
    }

    fn execute(&self, inner: &mut SoftQpInner, wr: WorkRequest) {
        let opcode = wr.opcode();
        if inner.state == QpState::Error {
            self.complete(wr.wr_id, WcStatus::WrFlushError, opcode, 0);
            return;
        }
        if let Some(pos) = inner.faults.iter().position(|(op, _)| *op == opcode) {
            if let Some((_, status)) = inner.faults.remove(pos) {
                debug!(qp = self.qp_num, wr_id = wr.wr_id, ?status, "injected fault");
                inner.state = QpState::Error;
                self.complete(wr.wr_id, status, opcode, 0);
                return;
            }
        }

        let (remote_addr, rkey) = match &wr.op {
            WorkRequestOp::RdmaWrite { remote_addr, rkey, .. }
            | WorkRequestOp::RdmaRead { remote_addr, rkey, .. } => (Some(*remote_addr), Some(*rkey)),
            WorkRequestOp::LocalInvalidate { rkey } => (None, Some(*rkey)),
            WorkRequestOp::RegisterMr { mr, .. } => (None, Some(mr.rkey)),
            WorkRequestOp::RegisterSignature { sig_mr, .. } => (None, Some(sig_mr.rkey)),
            WorkRequestOp::Send { .. } => (None, None),
        };
        let bytes = wr.byte_len();
        inner.log.push(ExecutedWr {
            wr_id: wr.wr_id,
            opcode,
            remote_addr,
            rkey,
            bytes,
            sge_count: wr.sges().len(),
        });
        if wr.signaled {
            self.complete(wr.wr_id, WcStatus::Success, opcode, bytes as u32);
        }
    }

    fn validate(&self, wr: &WorkRequest) -> Result<(), String> {
        let limit = match wr.op {
            WorkRequestOp::RdmaRead { .. } => self.max_sge_rd,
            _ => self.attr.max_send_sge,
        };
        if wr.sges().len() > limit {
            return Err(format!("{} sges exceed limit {}", wr.sges().len(), limit));
        }
        match &wr.op {
            WorkRequestOp::RegisterMr { mr, pages, .. } if *pages > mr.max_pages => {
                Err(format!("{} pages exceed mr capacity {}", pages, mr.max_pages))
            }
            WorkRequestOp::RegisterSignature { sig_mr, .. } if sig_mr.kind != MrKind::Signature => {
                Err("signature registration on a non-signature mr".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Execute up to `n` held requests. Returns how many ran.
    pub fn complete_pending(&self, n: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < n {
            let Some(wr) = inner.pending.pop_front() else {
                break;
            };
            self.execute(&mut inner, wr);
            done += 1;
        }
        done
    }

    pub fn complete_all(&self) -> usize {
        self.complete_pending(usize::MAX)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn posted_recvs(&self) -> usize {
        self.inner.lock().recvs.len()
    }

    /// Hold send requests until [`Self::complete_pending`] is called.
    pub fn set_auto_complete(&self, auto: bool) {
        self.inner.lock().auto_complete = auto;
    }

    /// Let held send requests flush after the receive queue when the queue
    /// pair moves to Error, the way an HCA that drains its queues
    /// independently may report them.
    pub fn set_send_flush_deferred(&self, deferred: bool) {
        self.inner.lock().defer_send_flush = deferred;
    }

    /// Fail the next request with `opcode` and move the queue pair to Error.
    pub fn inject_fault(&self, opcode: WcOpcode, status: WcStatus) {
        self.inner.lock().faults.push_back((opcode, status));
    }

    pub fn executed(&self) -> Vec<ExecutedWr> {
        self.inner.lock().log.clone()
    }

    /// Land an inbound message in the oldest posted receive.
    pub fn deliver(&self, payload: &[u8]) -> IserResult<()> {
        let mut inner = self.inner.lock();
        let recv = inner
            .recvs
            .pop_front()
            .ok_or_else(|| IserError::Verbs("receive queue empty".to_string()))?;
        if payload.len() > recv.sge.length as usize {
            inner.state = QpState::Error;
            self.complete(recv.wr_id, WcStatus::LocalLengthError, WcOpcode::Recv, 0);
            return Ok(());
        }
        // SAFETY: the posting side keeps every receive buffer alive and
        // untouched until its completion is reaped, and `payload.len()` was
        // checked against the posted length above.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), recv.sge.addr as *mut u8, payload.len());
        }
        self.complete(recv.wr_id, WcStatus::Success, WcOpcode::Recv, payload.len() as u32);
        Ok(())
    }
}

impl QueuePair for SoftQueuePair {
    fn qp_num(&self) -> u32 {
        self.qp_num
    }

    fn state(&self) -> QpState {
        self.inner.lock().state
    }

    fn modify_to_rts(&self) -> IserResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            QpState::Error => Err(IserError::Verbs("qp in error state".to_string())),
            _ => {
                inner.state = QpState::ReadyToSend;
                Ok(())
            }
        }
    }

    fn modify_to_error(&self) -> IserResult<()> {
        let mut inner = self.inner.lock();
        inner.state = QpState::Error;
        while !inner.defer_send_flush {
            let Some(wr) = inner.pending.pop_front() else {
                break;
            };
            self.complete(wr.wr_id, WcStatus::WrFlushError, wr.opcode(), 0);
        }
        while let Some(recv) = inner.recvs.pop_front() {
            self.complete(recv.wr_id, WcStatus::WrFlushError, WcOpcode::Recv, 0);
        }
        Ok(())
    }

    fn post_send(&self, wrs: &[WorkRequest]) -> Result<(), PostFailure> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, QpState::ReadyToSend | QpState::Error) {
            return Err(PostFailure {
                index: 0,
                reason: format!("qp in {:?}", inner.state),
            });
        }
        let mut failure = None;
        for (index, wr) in wrs.iter().enumerate() {
            if let Err(reason) = self.validate(wr) {
                failure = Some(PostFailure { index, reason });
                break;
            }
            inner.pending.push_back(wr.clone());
        }
        if inner.auto_complete || (inner.state == QpState::Error && !inner.defer_send_flush) {
            while let Some(wr) = inner.pending.pop_front() {
                self.execute(&mut inner, wr);
            }
        }
        match failure {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }

    fn post_recv(&self, wrs: &[RecvRequest]) -> Result<(), PostFailure> {
        let mut inner = self.inner.lock();
        for recv in wrs {
            if inner.state == QpState::Error {
                self.complete(recv.wr_id, WcStatus::WrFlushError, WcOpcode::Recv, 0);
            } else {
                inner.recvs.push_back(*recv);
            }
        }
        Ok(())
    }
}

/// Software device.
pub struct SoftDevice {
    name: String,
    attrs: DeviceAttributes,
    next_id: AtomicU32,
    auto_complete: AtomicBool,
    cqs: Mutex<FxHashMap<u32, Arc<SoftCq>>>,
    qps: Mutex<FxHashMap<u32, Arc<SoftQueuePair>>>,
    mrs: Mutex<FxHashMap<u32, MrKind>>,
    sig_faults: Mutex<VecDeque<SignatureError>>,
}

impl SoftDevice {
    pub fn new(name: impl Into<String>, attrs: DeviceAttributes) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            attrs,
            next_id: AtomicU32::new(1),
            auto_complete: AtomicBool::new(true),
            cqs: Mutex::new(FxHashMap::default()),
            qps: Mutex::new(FxHashMap::default()),
            mrs: Mutex::new(FxHashMap::default()),
            sig_faults: Mutex::new(VecDeque::new()),
        })
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether queue pairs created from now on execute requests as they are posted.
    pub fn set_auto_complete(&self, auto: bool) {
        self.auto_complete.store(auto, Ordering::Relaxed);
    }

    pub fn queue_pair(&self, qp_num: u32) -> Option<Arc<SoftQueuePair>> {
        self.qps.lock().get(&qp_num).cloned()
    }

    pub fn live_qps(&self) -> usize {
        self.qps.lock().len()
    }

    pub fn live_cqs(&self) -> usize {
        self.cqs.lock().len()
    }

    /// Memory regions allocated and not yet released.
    pub fn live_mrs(&self) -> usize {
        self.mrs.lock().len()
    }

    /// Report `err` from the next signature status check.
    pub fn inject_signature_error(&self, err: SignatureError) {
        self.sig_faults.lock().push_back(err);
    }
}

impl VerbsDevice for SoftDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_attributes(&self) -> DeviceAttributes {
        self.attrs.clone()
    }

    fn create_cq(
        &self,
        entries: usize,
        _vector: usize,
        notifier: CqNotifier,
    ) -> IserResult<Arc<dyn CompletionQueue>> {
        if entries == 0 || entries > self.attrs.max_cqe {
            return Err(IserError::Verbs(format!("invalid cq size {}", entries)));
        }
        let cq = Arc::new(SoftCq {
            id: self.next_id(),
            capacity: entries,
            entries: Mutex::new(VecDeque::new()),
            armed: AtomicBool::new(false),
            notifier,
        });
        self.cqs.lock().insert(cq.id, cq.clone());
        Ok(cq)
    }

    fn create_qp(
        &self,
        cq: &Arc<dyn CompletionQueue>,
        attr: &QpInitAttr,
    ) -> IserResult<Arc<dyn QueuePair>> {
        if attr.max_send_sge > self.attrs.max_sge {
            return Err(IserError::Verbs(format!(
                "max_send_sge {} exceeds device limit {}",
                attr.max_send_sge, self.attrs.max_sge
            )));
        }
        if attr.signature_enabled && !self.attrs.signature_handover {
            return Err(IserError::Verbs("signature offload unsupported".to_string()));
        }
        let soft_cq = self
            .cqs
            .lock()
            .get(&cq.id())
            .cloned()
            .ok_or_else(|| IserError::Verbs(format!("cq {} not created by {}", cq.id(), self.name)))?;
        let qp = Arc::new(SoftQueuePair {
            qp_num: self.next_id(),
            cq: soft_cq,
            attr: *attr,
            max_sge_rd: self.attrs.max_sge_rd.min(attr.max_send_sge),
            inner: Mutex::new(SoftQpInner {
                state: QpState::Init,
                auto_complete: self.auto_complete.load(Ordering::Relaxed),
                defer_send_flush: false,
                pending: VecDeque::new(),
                recvs: VecDeque::new(),
                faults: VecDeque::new(),
                log: Vec::new(),
            }),
        });
        self.qps.lock().insert(qp.qp_num, qp.clone());
        Ok(qp)
    }

    fn destroy_qp(&self, qp: &dyn QueuePair) -> IserResult<()> {
        let soft = self
            .qps
            .lock()
            .remove(&qp.qp_num())
            .ok_or_else(|| IserError::Verbs(format!("unknown qp {}", qp.qp_num())))?;
        let mut inner = soft.inner.lock();
        let discarded = inner.pending.len() + inner.recvs.len();
        if discarded > 0 {
            debug!(qp = soft.qp_num, discarded, "destroying qp with posted requests");
        }
        inner.pending.clear();
        inner.recvs.clear();
        inner.state = QpState::Reset;
        Ok(())
    }

    fn destroy_cq(&self, cq: &dyn CompletionQueue) -> IserResult<()> {
        let id = cq.id();
        if self.qps.lock().values().any(|qp| qp.cq.id == id) {
            return Err(IserError::Verbs(format!("cq {} still has queue pairs", id)));
        }
        match self.cqs.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(IserError::Verbs(format!("unknown cq {}", id))),
        }
    }

    fn alloc_mr(&self, kind: MrKind, max_pages: usize) -> IserResult<MrHandle> {
        if max_pages > self.attrs.max_fast_reg_page_list_len {
            return Err(IserError::Verbs(format!(
                "{} pages exceed fast-reg limit {}",
                max_pages, self.attrs.max_fast_reg_page_list_len
            )));
        }
        if kind == MrKind::Signature && !self.attrs.signature_handover {
            return Err(IserError::Verbs("signature regions unsupported".to_string()));
        }
        let id = self.next_id();
        self.mrs.lock().insert(id, kind);
        let key = id << 8;
        Ok(MrHandle {
            id,
            lkey: key,
            rkey: key,
            kind,
            max_pages,
        })
    }

    fn dealloc_mr(&self, mr: &MrHandle) -> IserResult<()> {
        match self.mrs.lock().remove(&mr.id) {
            Some(_) => Ok(()),
            None => Err(IserError::Verbs(format!("unknown mr {}", mr.id))),
        }
    }

    fn check_signature_status(&self, mr: &MrHandle) -> IserResult<Option<SignatureError>> {
        if mr.kind != MrKind::Signature {
            return Err(IserError::Verbs("not a signature region".to_string()));
        }
        Ok(self.sig_faults.lock().pop_front())
    }
}
