//! iSER connection: queue pair, registration pool and lifecycle.
//!
//! # Lifecycle
//!
//! A connection is created on a connect request (INIT), becomes UP when the
//! connection manager reports it established, FULL_FEATURE once login
//! completes, and TERMINATING on disconnect, logout or a fatal completion.
//! Entering TERMINATING moves the queue pair to Error and posts a beacon
//! receive behind everything already queued. The beacon's completion is the
//! drain barrier: nothing posted earlier can still be outstanding once it is
//! seen.
//!
//! Resources are released when the reference count drops to zero. The
//! connection manager holds one reference, every in-flight command holds one
//! and the beacon holds one until its completion.
//!
//! # Module Structure
//!
//! - `command` - transfer requests and per-command context
//! - `mapper` - scatter list to work-request chain
//! - `config` - connection and device configuration
//! - `protocol` - constants and wr_id encoding
//! - `recv` - receive descriptor ring
//! - `shutdown` - logout-style teardown

mod command;
mod completion;
pub mod config;
pub mod mapper;
pub mod protocol;
mod recv;
mod refcount;
mod shutdown;
mod state;
mod types;

pub use command::{
    CommandTransferContext, Direction, ProtectionOp, ProtectionRequest, TransferHandle,
    TransferRequest,
};
pub use completion::Signal;
pub use config::{ConnectionConfig, DeviceConfig};
pub use refcount::RefCount;
pub use shutdown::{ShutdownConfig, ShutdownResult};
pub use state::ConnectionState;
pub use types::TerminateReason;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::drivers::rdma::cm::CmId;
use crate::drivers::rdma::context::Device;
use crate::drivers::rdma::poller::CompletionSink;
use crate::drivers::rdma::verbs::{
    QpInitAttr, QueuePair, RecvRequest, Sge, WcStatus, WorkCompletion,
};
use crate::error::{IserError, IserResult};
use crate::memory::{PoolStats, RegistrationPool};
use crate::transport::framing::{IserPdu, ISER_HEADERS_LEN};
use crate::transport::{CommandHandler, FailureReason, TransferStatus};
use protocol::{decode_wr_id, WrKind, ISER_BEACON_WRID};
use recv::RecvRing;
use types::InflightCommand;

pub type ConnectionId = u64;

type ReleaseHook = Box<dyn FnOnce() + Send>;

enum BeaconOutcome {
    Posted,
    /// Could not post; the caller still owns the beacon reference.
    Failed,
    AlreadyPosted,
}

pub struct Connection {
    id: ConnectionId,
    cm_id: CmId,
    device: Arc<Device>,
    qp: Arc<dyn QueuePair>,
    processor: usize,
    config: ConnectionConfig,
    pi_support: bool,
    handler: Arc<dyn CommandHandler>,
    pool: Option<Arc<RegistrationPool>>,

    state: Mutex<ConnectionState>,
    // Serializes posting with the transition to TERMINATING.
    post_lock: Mutex<()>,
    inflight: DashMap<u64, InflightCommand>,
    next_seq: AtomicU64,
    rx: Mutex<Option<RecvRing>>,

    refs: RefCount,
    cm_ref_held: AtomicBool,
    beacon_posted: AtomicBool,
    beacon_seen: AtomicBool,
    pub(crate) logout_posted: AtomicBool,

    login_req: Signal,
    login: Signal,
    drained: Signal,
    released: Signal,
    release_hooks: Mutex<Vec<ReleaseHook>>,
}

impl Connection {
    /// Create the queue pair and registration pool for an incoming connect
    /// request. The returned connection is in INIT and holds the connection
    /// manager's reference.
    pub fn accept(
        device: &Arc<Device>,
        cm_id: CmId,
        config: ConnectionConfig,
        handler: Arc<dyn CommandHandler>,
    ) -> IserResult<Arc<Self>> {
        let caps = *device.caps();
        let verbs = device.verbs().clone();
        let pi_support = config.pi_enabled && caps.protection_capable;
        if config.pi_enabled && !pi_support {
            warn!(device = device.name(), "protection requested but not supported, disabling");
        }

        let max_qp_wr = verbs.query_attributes().max_qp_wr;
        let attr = QpInitAttr {
            max_send_wr: config.queue_depth.saturating_mul(4).saturating_add(1).min(max_qp_wr),
            max_recv_wr: config.recv_depth.saturating_add(1).min(max_qp_wr),
            max_send_sge: caps.max_send_sge,
            max_recv_sge: 1,
            signature_enabled: pi_support,
        };
        let processor = device.assign_processor();
        let qp = verbs.create_qp(device.processor(processor).cq(), &attr)?;

        let pool_size = if pi_support || caps.requires_read_registration {
            config.queue_depth
        } else {
            0
        };
        let pool = if pool_size > 0 {
            match RegistrationPool::new(verbs.clone(), pool_size, caps.max_registration_pages, pi_support) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    if let Err(destroy) = verbs.destroy_qp(qp.as_ref()) {
                        warn!(device = device.name(), "failed to destroy qp: {}", destroy);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let conn = Arc::new(Self {
            id: device.next_connection_id(),
            cm_id,
            device: device.clone(),
            qp,
            processor,
            config,
            pi_support,
            handler,
            pool,
            state: Mutex::new(ConnectionState::Init),
            post_lock: Mutex::new(()),
            inflight: DashMap::new(),
            next_seq: AtomicU64::new(0),
            rx: Mutex::new(None),
            refs: RefCount::new(),
            cm_ref_held: AtomicBool::new(true),
            beacon_posted: AtomicBool::new(false),
            beacon_seen: AtomicBool::new(false),
            logout_posted: AtomicBool::new(false),
            login_req: Signal::new(),
            login: Signal::new(),
            drained: Signal::new(),
            released: Signal::new(),
            release_hooks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&conn);
        conn.refs.set_release(move || {
            if let Some(conn) = weak.upgrade() {
                conn.release();
            }
        });
        let sink: Weak<dyn CompletionSink> = Arc::downgrade(&conn) as Weak<dyn CompletionSink>;
        device.processor(processor).attach(conn.qp.qp_num(), sink);
        device.register(conn.clone());

        info!(
            conn = conn.id,
            cm_id,
            qp = conn.qp.qp_num(),
            processor,
            pool_size,
            pi_support,
            "connection accepted"
        );
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn cm_id(&self) -> CmId {
        self.cm_id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn qp_num(&self) -> u32 {
        self.qp.qp_num()
    }

    pub fn processor_index(&self) -> usize {
        self.processor
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Protection offload negotiated for this connection.
    pub fn pi_support(&self) -> bool {
        self.pi_support
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(|p| p.stats())
    }

    pub fn ref_count(&self) -> usize {
        self.refs.count()
    }

    /// The drain barrier completed.
    pub fn is_drained(&self) -> bool {
        self.drained.is_complete()
    }

    /// Run `f` after resources are released.
    pub(crate) fn add_release_hook(&self, f: impl FnOnce() + Send + 'static) {
        self.release_hooks.lock().push(Box::new(f));
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    fn notify_state(&self, state: ConnectionState) {
        debug!(conn = self.id, %state, "state changed");
        self.handler.on_connection_state_changed(self, state);
    }

    /// The connection manager reported the connection established: move the
    /// queue pair to RTS, post receive descriptors and go UP.
    pub fn on_established(&self) -> IserResult<()> {
        let state = self.state();
        if state != ConnectionState::Init {
            return Err(IserError::ConnectionState {
                state,
                operation: "establish",
            });
        }
        if let Err(e) = self.qp.modify_to_rts() {
            warn!(conn = self.id, "failed to move qp to RTS: {}", e);
            self.terminate(TerminateReason::HandshakeFailure);
            return Err(e);
        }

        let ring = RecvRing::new(
            self.config.recv_depth,
            ISER_HEADERS_LEN + self.config.recv_data_len,
            self.device.caps().local_dma_lkey,
        );
        let requests = ring.requests();
        *self.rx.lock() = Some(ring);

        if !self.transition(ConnectionState::Up) {
            return Err(IserError::ConnectionState {
                state: self.state(),
                operation: "establish",
            });
        }
        self.notify_state(ConnectionState::Up);

        let posted = {
            let _guard = self.post_lock.lock();
            self.qp.post_recv(&requests)
        };
        if let Err(e) = posted {
            warn!(conn = self.id, "failed to post receive descriptors: {}", e);
            self.terminate(TerminateReason::HandshakeFailure);
            return Err(e.into());
        }
        debug!(conn = self.id, depth = requests.len(), "receive descriptors posted");
        Ok(())
    }

    /// Login finished; accept command traffic.
    pub fn login_complete(&self) -> IserResult<()> {
        if !self.transition(ConnectionState::FullFeature) {
            return Err(IserError::ConnectionState {
                state: self.state(),
                operation: "login_complete",
            });
        }
        self.login.complete();
        self.notify_state(ConnectionState::FullFeature);
        Ok(())
    }

    /// Wait for the first PDU from the initiator. On timeout the connection is failed.
    pub async fn wait_for_login_request(&self, timeout: Duration) -> IserResult<()> {
        if self.login_req.wait_timeout(timeout).await {
            return Ok(());
        }
        warn!(conn = self.id, ?timeout, "no login request received");
        self.terminate(TerminateReason::HandshakeFailure);
        Err(IserError::HandshakeTimeout("login request"))
    }

    /// Wait for [`Self::login_complete`]. On timeout the connection is failed.
    pub async fn wait_for_login(&self, timeout: Duration) -> IserResult<()> {
        if self.login.wait_timeout(timeout).await {
            return Ok(());
        }
        warn!(conn = self.id, ?timeout, "login did not complete");
        self.terminate(TerminateReason::HandshakeFailure);
        Err(IserError::HandshakeTimeout("login"))
    }

    /// Post a command's data transfer.
    ///
    /// `on_transfer_complete` is called exactly once for every submit that
    /// returns `Ok`, possibly before this call returns. Errors are returned
    /// without a callback: [`IserError::ResourceExhausted`] is retryable,
    /// anything else is final for the command.
    pub fn submit(&self, req: TransferRequest) -> IserResult<TransferHandle> {
        let tag = req.tag;
        let guard = self.post_lock.lock();
        let state = self.state();
        if state != ConnectionState::FullFeature {
            return Err(IserError::ConnectionState {
                state,
                operation: "submit",
            });
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let ctx = mapper::map_command(
            self.device.caps(),
            self.pool.as_ref(),
            self.pi_support,
            seq,
            req,
        )?;
        let handle = ctx.handle();

        if ctx.is_empty() {
            drop(guard);
            self.handler
                .on_transfer_complete(self, tag, TransferStatus::Success);
            return Ok(handle);
        }
        self.post_chain(guard, ctx, true)?;
        Ok(handle)
    }

    /// Send a control PDU such as a login response.
    pub fn send_pdu(&self, pdu: &IserPdu) -> IserResult<()> {
        let guard = self.post_lock.lock();
        let state = self.state();
        if !state.accepts_posts() {
            return Err(IserError::ConnectionState {
                state,
                operation: "send_pdu",
            });
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let ctx = mapper::map_send(self.device.caps(), seq, pdu.itt(), pdu.encode())?;
        self.post_chain(guard, ctx, false)
    }

    fn post_chain(
        &self,
        guard: MutexGuard<'_, ()>,
        ctx: CommandTransferContext,
        notify: bool,
    ) -> IserResult<()> {
        if !self.refs.get() {
            return Err(IserError::ConnectionState {
                state: self.state(),
                operation: "post",
            });
        }
        let seq = ctx.seq;
        let outstanding = ctx.signaled_count();
        // The entry must exist before the first completion can arrive.
        self.inflight.insert(
            seq,
            InflightCommand {
                ctx,
                outstanding,
                first_error: None,
                notify,
                post_failed: false,
            },
        );
        let outcome = self.inflight.get(&seq).map(|entry| {
            let wrs = entry.ctx.work_requests();
            self.qp.post_send(wrs).map_err(|f| {
                let unposted = wrs[f.index.min(wrs.len())..]
                    .iter()
                    .filter(|w| w.signaled)
                    .count();
                (f, unposted)
            })
        });
        drop(guard);

        let Some(Err((failure, unposted))) = outcome else {
            return Ok(());
        };
        warn!(conn = self.id, seq, "chain post failed: {}", failure);
        let finished = self
            .inflight
            .get_mut(&seq)
            .map(|mut entry| {
                entry.post_failed = true;
                entry.notify = false;
                entry.outstanding -= unposted;
                entry.outstanding == 0
            })
            .unwrap_or(false);
        if finished {
            self.finish_command(seq);
        }
        self.terminate(TerminateReason::PostFailure);
        Err(failure.into())
    }

    fn finish_command(&self, seq: u64) {
        let Some((_, cmd)) = self.inflight.remove(&seq) else {
            return;
        };
        let InflightCommand {
            mut ctx,
            first_error,
            notify,
            post_failed,
            ..
        } = cmd;
        let status = match first_error {
            Some(s) if s.is_flush() => TransferStatus::Failed(FailureReason::ConnectionTerminated),
            Some(s) => TransferStatus::Failed(FailureReason::WorkCompletion(s)),
            None if post_failed => TransferStatus::Failed(FailureReason::PostFailed),
            None => self.check_protection(&mut ctx),
        };
        let tag = ctx.tag;
        // Returns the registration descriptor before the upper layer reuses the tag.
        drop(ctx);
        if notify {
            self.handler.on_transfer_complete(self, tag, status);
        }
        self.refs.put();
    }

    fn check_protection(&self, ctx: &mut CommandTransferContext) -> TransferStatus {
        let (Some(check), Some(lease)) = (ctx.protection, ctx.lease.as_mut()) else {
            return TransferStatus::Success;
        };
        if !lease.sig_protected {
            return TransferStatus::Success;
        }
        lease.sig_protected = false;
        let Some(sig_mr) = lease.sig_mr else {
            return TransferStatus::Success;
        };
        match self.device.verbs().check_signature_status(&sig_mr) {
            Ok(None) => TransferStatus::Success,
            Ok(Some(err)) => {
                let bad_block = check.initial_ref_tag as u64
                    + ctx.ref_tag_offset
                    + err.offset / check.attrs.block_size as u64;
                warn!(
                    conn = self.id,
                    tag = ctx.tag,
                    kind = ?err.kind,
                    bad_block,
                    "protection check failed"
                );
                TransferStatus::ProtectionError {
                    bad_block,
                    kind: err.kind,
                }
            }
            Err(e) => {
                warn!(conn = self.id, tag = ctx.tag, "signature status unavailable: {}", e);
                TransferStatus::Failed(FailureReason::WorkCompletion(WcStatus::GeneralError))
            }
        }
    }

    /// Move to TERMINATING and start the drain barrier. In INIT the
    /// connection fails fast to DOWN instead. Idempotent.
    pub fn terminate(&self, reason: TerminateReason) {
        match self.state() {
            ConnectionState::Init => {
                info!(conn = self.id, ?reason, "connection failed before establishment");
                self.put_cm_ref();
            }
            ConnectionState::Up | ConnectionState::FullFeature => {
                let outcome = {
                    let _guard = self.post_lock.lock();
                    if !self.transition(ConnectionState::Terminating) {
                        return;
                    }
                    info!(conn = self.id, ?reason, inflight = self.inflight.len(), "terminating");
                    if let Err(e) = self.qp.modify_to_error() {
                        warn!(conn = self.id, "failed to move qp to error: {}", e);
                    }
                    self.post_beacon()
                };
                self.notify_state(ConnectionState::Terminating);
                if let BeaconOutcome::Failed = outcome {
                    // Nothing will flush behind a beacon that was never posted.
                    self.beacon_seen.store(true, Ordering::Release);
                    self.drained.complete();
                    self.refs.put();
                }
            }
            ConnectionState::Terminating | ConnectionState::Down => {
                debug!(conn = self.id, ?reason, "already terminating");
            }
        }
    }

    fn post_beacon(&self) -> BeaconOutcome {
        if self.beacon_posted.swap(true, Ordering::AcqRel) {
            return BeaconOutcome::AlreadyPosted;
        }
        if !self.refs.get() {
            return BeaconOutcome::AlreadyPosted;
        }
        let beacon = RecvRequest {
            wr_id: ISER_BEACON_WRID,
            sge: Sge {
                addr: 0,
                length: 0,
                lkey: self.device.caps().local_dma_lkey,
            },
        };
        match self.qp.post_recv(&[beacon]) {
            Ok(()) => {
                debug!(conn = self.id, "drain beacon posted");
                BeaconOutcome::Posted
            }
            Err(e) => {
                warn!(conn = self.id, "failed to post drain beacon: {}", e);
                BeaconOutcome::Failed
            }
        }
    }

    /// Drop the connection manager's reference, normally on timewait exit.
    /// Only the first call counts.
    ///
    /// A connection that can still post is terminated first, so release
    /// waits for the drain barrier instead of racing posted requests.
    pub fn put_cm_ref(&self) {
        if !self.cm_ref_held.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.state().accepts_posts() {
            self.terminate(TerminateReason::Disconnect);
        }
        self.refs.put();
    }

    /// Logout-style teardown: terminate, wait for the drain barrier, then
    /// drop the connection manager's reference.
    pub async fn shutdown(&self, config: &ShutdownConfig) -> ShutdownResult {
        shutdown::graceful_shutdown(self, config).await
    }

    pub(crate) async fn wait_drained(&self, timeout: Duration) -> bool {
        self.drained.wait_timeout(timeout).await
    }

    /// Wait until resources have been released. Returns false on timeout.
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        self.released.wait_timeout(timeout).await
    }

    fn on_beacon(&self) {
        self.beacon_seen.store(true, Ordering::Release);
        debug!(conn = self.id, "drain barrier reached");
        self.drained.complete();
        self.refs.put();
    }

    fn on_command_completion(&self, seq: u64, wc: &WorkCompletion) {
        let done = match self.inflight.get_mut(&seq) {
            Some(mut entry) => {
                entry.outstanding = entry.outstanding.saturating_sub(1);
                if !wc.status.is_success() && entry.first_error.is_none() {
                    entry.first_error = Some(wc.status);
                }
                entry.outstanding == 0
            }
            None => {
                warn!(conn = self.id, seq, wr_id = wc.wr_id, "completion for unknown command");
                false
            }
        };
        if done {
            self.finish_command(seq);
        }
        if !wc.status.is_success() {
            self.on_error_completion(wc);
        }
    }

    fn on_error_completion(&self, wc: &WorkCompletion) {
        if wc.status.is_success() {
            return;
        }
        if wc.status.is_flush() {
            debug!(conn = self.id, wr_id = wc.wr_id, "flushed");
        } else {
            warn!(
                conn = self.id,
                wr_id = wc.wr_id,
                status = ?wc.status,
                opcode = ?wc.opcode,
                "work request failed"
            );
        }
        self.terminate(TerminateReason::WorkCompletionError);
    }

    fn on_recv_completion(&self, index: u32, wc: &WorkCompletion) {
        if !wc.status.is_success() {
            self.on_error_completion(wc);
            return;
        }
        let frame = self
            .rx
            .lock()
            .as_ref()
            .and_then(|ring| ring.copy_frame(index, wc.byte_len as usize));
        let Some(frame) = frame else {
            warn!(conn = self.id, index, len = wc.byte_len, "receive for unknown descriptor");
            return;
        };
        self.repost_recv(index);

        match IserPdu::decode(frame, self.config.recv_data_len) {
            Ok(pdu) => {
                self.login_req.complete();
                self.handler.on_pdu_received(self, pdu);
            }
            Err(e) => warn!(conn = self.id, "dropping malformed pdu: {}", e),
        }
    }

    fn repost_recv(&self, index: u32) {
        let result = {
            let _guard = self.post_lock.lock();
            if !self.state().accepts_posts() {
                return;
            }
            let request = self.rx.lock().as_ref().and_then(|ring| ring.request(index));
            match request {
                Some(req) => self.qp.post_recv(&[req]),
                None => return,
            }
        };
        if let Err(e) = result {
            warn!(conn = self.id, index, "failed to repost receive: {}", e);
            self.terminate(TerminateReason::PostFailure);
        }
    }

    /// Runs once, when the last reference is dropped.
    fn release(&self) {
        let prev = {
            let mut state = self.state.lock();
            let prev = *state;
            *state = ConnectionState::Down;
            prev
        };
        if !prev.can_transition_to(ConnectionState::Down) {
            warn!(conn = self.id, %prev, "released from unexpected state");
        }
        if prev != ConnectionState::Down {
            self.notify_state(ConnectionState::Down);
        }
        debug_assert!(self.inflight.is_empty());

        self.device.processor(self.processor).detach(self.qp.qp_num());
        // Receive buffers stay alive until the queue pair can no longer write them.
        if let Err(e) = self.device.verbs().destroy_qp(self.qp.as_ref()) {
            warn!(conn = self.id, qp = self.qp.qp_num(), "failed to destroy qp: {}", e);
        }
        if let Some(pool) = &self.pool {
            pool.destroy();
        }
        self.rx.lock().take();
        self.device.unregister(self.id);

        let hooks = std::mem::take(&mut *self.release_hooks.lock());
        for hook in hooks {
            hook();
        }
        info!(conn = self.id, "connection released");
        // Nothing can be outstanding once the last reference is gone.
        self.drained.complete();
        self.released.complete();
    }
}

impl CompletionSink for Connection {
    fn handle_completion(&self, wc: &WorkCompletion) {
        // The beacon sits on the receive queue. Treating it as the barrier for
        // send completions too assumes the send queue flushes ahead of the
        // receive queue once the queue pair is in Error. A send completion
        // reported later is dropped here and its command keeps its reference.
        if self.beacon_seen.load(Ordering::Acquire) {
            debug!(conn = self.id, wr_id = wc.wr_id, "completion after drain barrier ignored");
            return;
        }
        match decode_wr_id(wc.wr_id) {
            WrKind::Beacon => self.on_beacon(),
            WrKind::Command { seq, .. } => self.on_command_completion(seq, wc),
            WrKind::Recv { index } => self.on_recv_completion(index, wc),
            // The invalidate is unsignaled, so only its failure is reported.
            WrKind::FastRegInvalidate => self.on_error_completion(wc),
            WrKind::Unknown(wr_id) => {
                warn!(conn = self.id, wr_id, "completion with unknown wr_id");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("cm_id", &self.cm_id)
            .field("qp", &self.qp.qp_num())
            .field("state", &self.state())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}
