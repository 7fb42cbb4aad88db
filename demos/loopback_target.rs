//! Loopback iSER Target Demo
//!
//! Drives one connection through its whole lifecycle against the in-tree
//! software device: connect request, login exchange, a mix of RDMA reads and
//! protected RDMA writes, then logout.
//!
//! Run with:
//!   RUST_LOG=iser_rdma=debug cargo run --example loopback_target

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iser_rdma::drivers::rdma::cm::ConnectParams;
use iser_rdma::drivers::rdma::soft::SoftDevice;
use iser_rdma::drivers::rdma::verbs::{DeviceAttributes, VerbsDevice};
use iser_rdma::memory::DmaDirection;
use iser_rdma::pool::DevicePool;
use iser_rdma::transport::framing::{IserHeader, IserPdu};
use iser_rdma::{
    CmDispatcher, CmEvent, CommandHandler, Connection, ConnectionConfig, ConnectionState,
    DataBuf, DeviceConfig, Direction, ProtectionOp, ProtectionRequest, RemoteRegion,
    ScatterEntry, ShutdownConfig, TransferRequest, TransferStatus,
};

const CM_ID: u64 = 1;
const COMMANDS: u32 = 64;

struct Target {
    done: flume::Sender<(u32, TransferStatus)>,
}

impl CommandHandler for Target {
    fn on_transfer_complete(&self, _conn: &Connection, tag: u32, status: TransferStatus) {
        let _ = self.done.send((tag, status));
    }

    fn on_connection_state_changed(&self, conn: &Connection, state: ConnectionState) {
        println!("  connection {} -> {}", conn.id(), state);
    }

    fn on_pdu_received(&self, conn: &Connection, pdu: IserPdu) {
        println!(
            "  pdu opcode={:#04x} itt={:#x} data={} bytes",
            pdu.opcode(),
            pdu.itt(),
            pdu.data.len()
        );
        // Login response
        let mut bhs = [0u8; 48];
        bhs[0] = 0x23;
        bhs[16..20].copy_from_slice(&pdu.itt().to_be_bytes());
        let rsp = IserPdu::new(IserHeader::control(), bhs, Bytes::new());
        if let Err(e) = conn.send_pdu(&rsp) {
            eprintln!("  login response failed: {}", e);
        }
    }
}

fn login_request() -> Bytes {
    let text = b"InitiatorName=iqn.2004-10.com.example:loopback\0";
    let mut bhs = [0u8; 48];
    bhs[0] = 0x43;
    bhs[5..8].copy_from_slice(&(text.len() as u32).to_be_bytes()[1..]);
    bhs[16..20].copy_from_slice(&0x1u32.to_be_bytes());
    IserPdu::new(IserHeader::control(), bhs, Bytes::from_static(text)).encode()
}

fn transfer(tag: u32) -> TransferRequest {
    let len = 64 * 1024u64;
    let entries: Vec<ScatterEntry> = (0..16u64)
        .map(|i| ScatterEntry::new(0x4000_0000 + (tag as u64) * 0x100_0000 + i * 0x2000, 4096))
        .collect();
    let remote = RemoteRegion::new(0x100 + tag, 0x7f00_0000_0000 + tag as u64 * len, len);
    if tag % 2 == 0 {
        let data = DataBuf::map(&entries, 0, len, DmaDirection::FromDevice).unwrap_or_else(|e| panic!("{}", e));
        TransferRequest::new(tag, Direction::Read, data, remote)
    } else {
        let data = DataBuf::map(&entries, 0, len, DmaDirection::ToDevice).unwrap_or_else(|e| panic!("{}", e));
        TransferRequest::new(tag, Direction::Write, data, remote).with_protection(ProtectionRequest {
            op: ProtectionOp::DinInsert,
            block_size: 512,
            initial_ref_tag: tag * 128,
            buf: None,
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    println!("=== Loopback iSER Target ===");
    let soft = SoftDevice::new(
        "soft0",
        DeviceAttributes {
            signature_handover: true,
            ..Default::default()
        },
    );
    let verbs: Arc<dyn VerbsDevice> = soft.clone();

    let (done_tx, done_rx) = flume::unbounded();
    let devices = Arc::new(DevicePool::new(DeviceConfig::default()));
    let config = ConnectionConfig::default().with_pi_enabled(true);
    let login_timeout = config.login_timeout;
    let cm = Arc::new(CmDispatcher::new(
        devices.clone(),
        config,
        Arc::new(Target { done: done_tx }),
    ));
    let (cm_tx, cm_rx) = flume::unbounded();
    let cm_thread = match cm.clone().spawn(cm_rx) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("failed to start cm thread: {}", e);
            return;
        }
    };

    println!("\n[1] connect");
    let _ = cm_tx.send(CmEvent::ConnectRequest {
        cm_id: CM_ID,
        device: verbs,
        params: ConnectParams { queue_depth: Some(32) },
    });
    let _ = cm_tx.send(CmEvent::Established { cm_id: CM_ID });

    let conn = loop {
        if let Some(conn) = cm.connection(CM_ID) {
            if conn.state() == ConnectionState::Up {
                break conn;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    let Some(qp) = soft.queue_pair(conn.qp_num()) else {
        eprintln!("queue pair vanished");
        return;
    };

    println!("\n[2] login");
    if let Err(e) = qp.deliver(&login_request()) {
        eprintln!("deliver failed: {}", e);
        return;
    }
    if let Err(e) = conn.wait_for_login_request(login_timeout).await {
        eprintln!("login failed: {}", e);
        return;
    }
    if let Err(e) = conn.login_complete() {
        eprintln!("login failed: {}", e);
        return;
    }

    println!("\n[3] {} transfers", COMMANDS);
    let start = Instant::now();
    let mut submitted = 0;
    for tag in 0..COMMANDS {
        loop {
            match conn.submit(transfer(tag)) {
                Ok(_) => break,
                Err(e) if e.is_retryable() => tokio::task::yield_now().await,
                Err(e) => {
                    eprintln!("  tag {} failed: {}", tag, e);
                    break;
                }
            }
        }
        submitted += 1;
    }
    let mut ok = 0;
    for _ in 0..submitted {
        match done_rx.recv_async().await {
            Ok((_, status)) if status.is_success() => ok += 1,
            Ok((tag, status)) => println!("  tag {}: {}", tag, status),
            Err(_) => break,
        }
    }
    let elapsed = start.elapsed();
    println!(
        "  {}/{} ok in {:?}, {} work requests executed, pool {:?}",
        ok,
        submitted,
        elapsed,
        qp.executed().len(),
        conn.pool_stats()
    );

    println!("\n[4] logout");
    let result = conn.shutdown(&ShutdownConfig::from(conn.config())).await;
    let released = conn.wait_released(Duration::from_secs(1)).await;
    println!("  shutdown {:?}, released {}", result, released);

    drop(cm_tx);
    let _ = cm_thread.join();
    println!("\nDone: {} devices open", devices.len());
}
