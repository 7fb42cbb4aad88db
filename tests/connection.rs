mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use common::{next_state, wait_for, Event, Harness, Recorder, TIMEOUT};
use iser_rdma::drivers::rdma::soft::SoftDevice;
use iser_rdma::drivers::rdma::transport::TerminateReason;
use iser_rdma::drivers::rdma::verbs::{
    DeviceAttributes, SignatureError, SignatureErrorKind, TransportKind, WcOpcode, WcStatus,
};
use iser_rdma::memory::DmaDirection;
use iser_rdma::transport::framing::{IserHeader, IserPdu};
use iser_rdma::{
    Connection, ConnectionConfig, ConnectionState, DataBuf, Device, DeviceConfig, Direction, FailureReason,
    IserError, ProtectionOp, ProtectionRequest, RemoteRegion, ScatterEntry, ShutdownConfig,
    ShutdownResult, TransferRequest, TransferStatus,
};

fn small_config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_queue_depth(8)
        .with_recv_depth(8)
}

fn single_cpu() -> DeviceConfig {
    DeviceConfig::default().with_max_completion_queues(1)
}

fn write_req(tag: u32, len: u32) -> TransferRequest {
    let data = DataBuf::map(
        &[ScatterEntry::new(0x10_0000 + tag as u64 * 0x10000, len)],
        0,
        len as u64,
        DmaDirection::ToDevice,
    )
    .unwrap();
    TransferRequest::new(tag, Direction::Write, data, RemoteRegion::new(0x55, 0x9000_0000, len as u64))
}

fn read_req(tag: u32, len: u32) -> TransferRequest {
    let data = DataBuf::map(
        &[ScatterEntry::new(0x20_0000 + tag as u64 * 0x10000, len)],
        0,
        len as u64,
        DmaDirection::FromDevice,
    )
    .unwrap();
    TransferRequest::new(tag, Direction::Read, data, RemoteRegion::new(0x66, 0xa000_0000, len as u64))
}

fn login_pdu(itt: u32, text: &'static [u8]) -> IserPdu {
    let mut bhs = [0u8; 48];
    bhs[0] = 0x03;
    bhs[5..8].copy_from_slice(&(text.len() as u32).to_be_bytes()[1..]);
    bhs[16..20].copy_from_slice(&itt.to_be_bytes());
    IserPdu::new(IserHeader::control(), bhs, Bytes::from_static(text))
}

fn drain_transfers(h: &Harness) -> Vec<(u32, TransferStatus)> {
    h.events
        .try_iter()
        .filter_map(|e| match e {
            Event::Transfer(tag, status) => Some((tag, status)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_one_mib_protected_write() {
    let attrs = DeviceAttributes {
        max_sge: 64,
        max_sge_rd: 64,
        max_fast_reg_page_list_len: 512,
        signature_handover: true,
        ..Default::default()
    };
    let h = Harness::full_feature(
        attrs,
        single_cpu().with_max_sg_table_size(512),
        small_config().with_pi_enabled(true),
    );
    assert!(h.conn.pi_support());

    const TOTAL: u64 = 1 << 20;
    let entries: Vec<ScatterEntry> = (0..300u64)
        .map(|i| {
            let len = if i < 299 { 3496 } else { (TOTAL - 299 * 3496) as u32 };
            ScatterEntry::new(0x1000_0000 + i * 0x10000, len)
        })
        .collect();
    let data = DataBuf::map(&entries, 0, TOTAL, DmaDirection::ToDevice).unwrap();
    assert_eq!(data.dma_nents(), 300);

    let req = TransferRequest::new(42, Direction::Write, data, RemoteRegion::new(0xabc, 0x7000_0000, TOTAL))
        .with_protection(ProtectionRequest {
            op: ProtectionOp::DinInsert,
            block_size: 512,
            initial_ref_tag: 0,
            buf: None,
        });

    h.qp.set_auto_complete(false);
    let handle = h.conn.submit(req).unwrap();
    // Data registration, signature registration, five writes.
    assert_eq!(handle.work_requests, 7);
    assert_eq!(handle.rdma_ops, 5);
    assert!(handle.registered);
    assert_eq!(h.qp.pending_len(), 7);

    // Not complete until every signaled request has completed.
    assert_eq!(h.qp.complete_pending(6), 6);
    thread::sleep(Duration::from_millis(50));
    assert!(drain_transfers(&h).is_empty());
    assert_eq!(h.qp.complete_pending(1), 1);
    assert_eq!(h.next_transfer(), (42, TransferStatus::Success));

    let executed = h.qp.executed();
    assert_eq!(executed[0].opcode, WcOpcode::RegisterMr);
    assert_eq!(executed[1].opcode, WcOpcode::RegisterMr);
    let writes: Vec<_> = executed.iter().filter(|w| w.opcode == WcOpcode::RdmaWrite).collect();
    assert_eq!(writes.len(), 5);
    assert_eq!(writes.iter().map(|w| w.bytes).sum::<u64>(), TOTAL);
    assert_eq!(
        writes.iter().map(|w| w.sge_count).collect::<Vec<_>>(),
        vec![64, 64, 64, 64, 44]
    );
    let mut expected_addr = 0x7000_0000;
    for w in &writes {
        assert_eq!(w.remote_addr, Some(expected_addr));
        assert_eq!(w.rkey, Some(0xabc));
        expected_addr += w.bytes;
    }
    assert_eq!(h.conn.pool_stats().unwrap().in_use, 0);
}

#[test]
fn test_pool_exhaustion_is_retryable() {
    let attrs = DeviceAttributes {
        transport: TransportKind::Iwarp,
        ..Default::default()
    };
    let h = Harness::full_feature(attrs, single_cpu(), small_config().with_queue_depth(4));
    assert_eq!(h.conn.pool_stats().unwrap().capacity, 4);

    h.qp.set_auto_complete(false);
    for tag in 0..4 {
        let handle = h.conn.submit(read_req(tag, 4096)).unwrap();
        assert_eq!(handle.work_requests, 2);
    }
    let err = h.conn.submit(read_req(4, 4096)).unwrap_err();
    assert!(matches!(err, IserError::ResourceExhausted(_)));
    assert!(err.is_retryable());
    assert_eq!(h.conn.pool_stats().unwrap().in_use, 4);

    h.qp.complete_all();
    let mut tags: Vec<u32> = (0..4).map(|_| h.next_transfer().0).collect();
    tags.sort_unstable();
    assert_eq!(tags, vec![0, 1, 2, 3]);
    assert!(drain_transfers(&h).is_empty());

    // The reused descriptor is invalidated before it is registered again.
    let handle = h.conn.submit(read_req(4, 4096)).unwrap();
    assert_eq!(handle.work_requests, 3);
    h.qp.complete_all();
    assert_eq!(h.next_transfer(), (4, TransferStatus::Success));
}

#[test]
fn test_terminate_flushes_before_drain_barrier() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    h.qp.set_auto_complete(false);
    h.conn.submit(write_req(10, 8192)).unwrap();
    h.conn.submit(write_req(11, 8192)).unwrap();
    assert_eq!(h.conn.ref_count(), 3);

    let qpn = h.conn.qp_num();
    h.conn.terminate(TerminateReason::Disconnect);
    assert_eq!(h.conn.state(), ConnectionState::Terminating);
    wait_for(|| h.conn.is_drained());

    // Both flushes were dispatched before the beacon.
    let events: Vec<Event> = h.events.try_iter().collect();
    let mut flushed: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Event::Transfer(tag, TransferStatus::Failed(FailureReason::ConnectionTerminated)) => Some(*tag),
            _ => None,
        })
        .collect();
    flushed.sort_unstable();
    assert_eq!(flushed, vec![10, 11]);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::State(ConnectionState::Terminating))));

    // Only the connection manager's reference is left.
    assert_eq!(h.conn.ref_count(), 1);
    assert!(matches!(
        h.conn.submit(write_req(12, 512)),
        Err(IserError::ConnectionState { state: ConnectionState::Terminating, .. })
    ));

    h.conn.put_cm_ref();
    assert_eq!(h.conn.state(), ConnectionState::Down);
    assert_eq!(next_state(&h.events), ConnectionState::Down);
    assert_eq!(h.device.connection_count(), 0);
    assert_eq!(h.device.active_qps(), vec![0]);
    assert!(h.verbs.queue_pair(qpn).is_none());
}

#[test]
fn test_dropping_cm_ref_on_live_connection_drains_first() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    let qpn = h.conn.qp_num();
    h.qp.set_auto_complete(false);
    h.conn.submit(write_req(30, 4096)).unwrap();
    assert_eq!(h.qp.posted_recvs(), 8);

    h.conn.put_cm_ref();
    // Receives were flushed before anything was freed.
    assert_eq!(h.qp.posted_recvs(), 0);

    // The flushed write and TERMINATING may be reported from different
    // threads; DOWN comes after both.
    let mut seen = Vec::new();
    loop {
        let event = h.events.recv_timeout(TIMEOUT).unwrap();
        let down = matches!(event, Event::State(ConnectionState::Down));
        seen.push(event);
        if down {
            break;
        }
    }
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::State(ConnectionState::Terminating))));
    assert!(seen.iter().any(|e| matches!(
        e,
        Event::Transfer(30, TransferStatus::Failed(FailureReason::ConnectionTerminated))
    )));
    assert!(h.conn.is_drained());
    assert_eq!(h.conn.inflight_count(), 0);
    assert!(h.verbs.queue_pair(qpn).is_none());

    // Only the first drop counts.
    h.conn.put_cm_ref();
    assert_eq!(h.conn.state(), ConnectionState::Down);
}

#[test]
fn test_failed_handshake_destroys_queue_pair() {
    common::init_tracing();
    let verbs = SoftDevice::new("soft0", DeviceAttributes::default());
    let device = Device::open(verbs.clone(), &single_cpu()).unwrap();
    assert_eq!(verbs.live_cqs(), 1);

    let (recorder, events) = Recorder::new();
    let conn = Connection::accept(&device, 1, small_config(), recorder).unwrap();
    let qpn = conn.qp_num();
    assert_eq!(verbs.live_qps(), 1);

    conn.terminate(TerminateReason::HandshakeFailure);
    assert_eq!(next_state(&events), ConnectionState::Down);
    assert!(verbs.queue_pair(qpn).is_none());
    assert_eq!(verbs.live_qps(), 0);
    assert_eq!(device.connection_count(), 0);

    drop(conn);
    drop(device);
    assert_eq!(verbs.live_cqs(), 0);
}

#[test]
fn test_completion_after_drain_barrier_is_ignored() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    let processor = h.device.processor(h.conn.processor_index());
    h.qp.set_auto_complete(false);
    h.qp.set_send_flush_deferred(true);
    h.conn.submit(write_req(20, 4096)).unwrap();
    assert_eq!(h.qp.pending_len(), 1);

    // Eight receive flushes and the beacon; the write is still queued.
    h.conn.terminate(TerminateReason::Disconnect);
    wait_for(|| h.conn.is_drained());
    wait_for(|| processor.processed() == 9);
    assert_eq!(h.conn.inflight_count(), 1);
    assert_eq!(h.conn.ref_count(), 2);

    assert_eq!(h.qp.complete_all(), 1);
    wait_for(|| processor.processed() == 10);
    assert!(drain_transfers(&h).is_empty());
    assert_eq!(h.conn.inflight_count(), 1);
    assert_eq!(h.conn.ref_count(), 2);
    assert_eq!(h.conn.state(), ConnectionState::Terminating);
}

#[test]
fn test_error_completion_terminates() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    h.qp.inject_fault(WcOpcode::RdmaWrite, WcStatus::RemoteAccessError);

    h.conn.submit(write_req(7, 4096)).unwrap();
    assert_eq!(
        h.next_transfer(),
        (7, TransferStatus::Failed(FailureReason::WorkCompletion(WcStatus::RemoteAccessError)))
    );
    assert_eq!(next_state(&h.events), ConnectionState::Terminating);
    wait_for(|| h.conn.is_drained());
    assert_eq!(h.conn.inflight_count(), 0);
}

#[test]
fn test_protection_error_reports_bad_block() {
    let attrs = DeviceAttributes {
        signature_handover: true,
        ..Default::default()
    };
    let h = Harness::full_feature(attrs, single_cpu(), small_config().with_pi_enabled(true));
    h.verbs.inject_signature_error(SignatureError {
        kind: SignatureErrorKind::Guard,
        offset: 1536,
    });

    // Second 4 KiB of the command: reference tags start 8 blocks in.
    let list = [ScatterEntry::new(0x1000_0000, 4096), ScatterEntry::new(0x2000_0000, 4096)];
    let data = DataBuf::map(&list, 4096, 4096, DmaDirection::ToDevice).unwrap();
    let req = TransferRequest::new(3, Direction::Write, data, RemoteRegion::new(1, 0x8000, 4096))
        .with_protection(ProtectionRequest {
            op: ProtectionOp::DinInsert,
            block_size: 512,
            initial_ref_tag: 100,
            buf: None,
        });
    h.conn.submit(req).unwrap();
    assert_eq!(
        h.next_transfer(),
        (
            3,
            TransferStatus::ProtectionError {
                bad_block: 111,
                kind: SignatureErrorKind::Guard
            }
        )
    );

    // The next command on the same connection is clean.
    h.conn.submit(write_req(4, 512)).unwrap();
    assert_eq!(h.next_transfer(), (4, TransferStatus::Success));
}

#[test]
fn test_protection_without_negotiation_is_rejected() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config().with_pi_enabled(true));
    assert!(!h.conn.pi_support());
    let req = write_req(1, 512).with_protection(ProtectionRequest {
        op: ProtectionOp::DinInsert,
        block_size: 512,
        initial_ref_tag: 0,
        buf: None,
    });
    assert!(matches!(h.conn.submit(req), Err(IserError::InvalidInput(_))));
    assert_eq!(h.conn.ref_count(), 1);
}

#[test]
fn test_oversized_buffer_rejected_without_callback() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    let entries: Vec<ScatterEntry> = (0..300u64)
        .map(|i| ScatterEntry::new(i * 0x10000, 512))
        .collect();
    let data = DataBuf::map(&entries, 0, 300 * 512, DmaDirection::ToDevice).unwrap();
    let req = TransferRequest::new(9, Direction::Write, data, RemoteRegion::new(1, 0, 300 * 512));
    assert!(matches!(
        h.conn.submit(req),
        Err(IserError::BufferTooLarge { entries: 300, max: 256 })
    ));
    thread::sleep(Duration::from_millis(20));
    assert!(drain_transfers(&h).is_empty());
    assert_eq!(h.conn.inflight_count(), 0);
}

#[test]
fn test_empty_transfer_completes_inline() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    let req = TransferRequest::new(
        5,
        Direction::Write,
        DataBuf::empty(DmaDirection::ToDevice),
        RemoteRegion::empty(),
    );
    let handle = h.conn.submit(req).unwrap();
    assert_eq!(handle.work_requests, 0);
    assert_eq!(h.next_transfer(), (5, TransferStatus::Success));
    assert!(h.qp.executed().is_empty());
}

#[test]
fn test_submit_requires_full_feature() {
    let h = Harness::up(DeviceAttributes::default(), single_cpu(), small_config());
    match h.conn.submit(write_req(1, 512)) {
        Err(IserError::ConnectionState { state, operation }) => {
            assert_eq!(state, ConnectionState::Up);
            assert_eq!(operation, "submit");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_response_rides_behind_data() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    let rsp = login_pdu(0x77, b"");
    let req = write_req(0x77, 2048).with_response(rsp.encode());
    let handle = h.conn.submit(req).unwrap();
    assert_eq!(handle.work_requests, 2);
    assert_eq!(h.next_transfer(), (0x77, TransferStatus::Success));

    let ops: Vec<WcOpcode> = h.qp.executed().iter().map(|w| w.opcode).collect();
    assert_eq!(ops, vec![WcOpcode::RdmaWrite, WcOpcode::Send]);
    assert_eq!(h.qp.executed()[1].bytes, rsp.encoded_len() as u64);
}

#[tokio::test]
async fn test_login_request_delivery() {
    let h = Harness::up(DeviceAttributes::default(), single_cpu(), small_config());
    assert_eq!(h.qp.posted_recvs(), 8);

    let pdu = login_pdu(0x1234, b"InitiatorName=iqn.2004-10.com.example:host");
    h.qp.deliver(&pdu.encode()).unwrap();
    h.conn.wait_for_login_request(TIMEOUT).await.unwrap();

    let got = loop {
        match h.events.recv_timeout(TIMEOUT).unwrap() {
            Event::Pdu(p) => break p,
            _ => continue,
        }
    };
    assert_eq!(got.itt(), 0x1234);
    assert!(got.header.is_control());
    assert_eq!(got.data, pdu.data);
    // Reposted before the handler saw it.
    assert_eq!(h.qp.posted_recvs(), 8);

    // Login response goes out before full feature phase.
    let rsp = login_pdu(0x1234, b"TargetPortalGroupTag=1");
    h.conn.send_pdu(&rsp).unwrap();
    wait_for(|| h.qp.executed().iter().any(|w| w.opcode == WcOpcode::Send));
    h.conn.login_complete().unwrap();
    h.conn.wait_for_login(TIMEOUT).await.unwrap();
    assert_eq!(h.conn.state(), ConnectionState::FullFeature);
    thread::sleep(Duration::from_millis(20));
    assert!(drain_transfers(&h).is_empty());
}

#[tokio::test]
async fn test_login_timeout_fails_connection() {
    let h = Harness::up(DeviceAttributes::default(), single_cpu(), small_config());
    let err = h.conn.wait_for_login(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, IserError::HandshakeTimeout(_)));
    assert!(err.is_connection_fatal());
    assert_eq!(h.conn.state(), ConnectionState::Terminating);
    wait_for(|| h.conn.is_drained());
}

#[tokio::test]
async fn test_logout_shutdown_releases() {
    let h = Harness::full_feature(DeviceAttributes::default(), single_cpu(), small_config());
    h.conn.submit(write_req(1, 4096)).unwrap();
    assert_eq!(h.next_transfer(), (1, TransferStatus::Success));

    let cfg = ShutdownConfig::from(h.conn.config());
    assert_eq!(h.conn.shutdown(&cfg).await, ShutdownResult::Drained);
    assert_eq!(h.conn.shutdown(&cfg).await, ShutdownResult::AlreadyShuttingDown);
    assert!(h.conn.wait_released(TIMEOUT).await);
    assert_eq!(h.conn.state(), ConnectionState::Down);
    assert_eq!(h.device.connection_count(), 0);
}

#[test]
fn test_concurrent_submitters_share_pool() {
    let attrs = DeviceAttributes {
        transport: TransportKind::Iwarp,
        ..Default::default()
    };
    let h = Harness::full_feature(attrs, single_cpu(), small_config().with_queue_depth(16));
    let conn = h.conn.clone();

    let workers: Vec<_> = (0..8u32)
        .map(|t| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                for i in 0..50u32 {
                    let tag = t * 1000 + i;
                    loop {
                        match conn.submit(read_req(tag, 1024)) {
                            Ok(_) => break,
                            Err(e) if e.is_retryable() => thread::yield_now(),
                            Err(e) => panic!("submit failed: {}", e),
                        }
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..400 {
        let (tag, status) = h.next_transfer();
        assert!(status.is_success());
        assert!(seen.insert(tag), "tag {} completed twice", tag);
    }
    let stats = h.conn.pool_stats().unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 16);
    assert_eq!(h.conn.inflight_count(), 0);
}
