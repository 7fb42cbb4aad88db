#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use iser_rdma::drivers::rdma::soft::{SoftDevice, SoftQueuePair};
use iser_rdma::drivers::rdma::verbs::DeviceAttributes;
use iser_rdma::transport::framing::IserPdu;
use iser_rdma::{
    CommandHandler, Connection, ConnectionConfig, ConnectionState, Device, DeviceConfig,
    TransferStatus,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum Event {
    Transfer(u32, TransferStatus),
    State(ConnectionState),
    Pdu(IserPdu),
}

/// Forwards every callback into a channel the test reads from.
pub struct Recorder {
    tx: flume::Sender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, flume::Receiver<Event>) {
        let (tx, rx) = flume::unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl CommandHandler for Recorder {
    fn on_transfer_complete(&self, _conn: &Connection, tag: u32, status: TransferStatus) {
        let _ = self.tx.send(Event::Transfer(tag, status));
    }

    fn on_connection_state_changed(&self, _conn: &Connection, state: ConnectionState) {
        let _ = self.tx.send(Event::State(state));
    }

    fn on_pdu_received(&self, _conn: &Connection, pdu: IserPdu) {
        let _ = self.tx.send(Event::Pdu(pdu));
    }
}

pub struct Harness {
    pub verbs: Arc<SoftDevice>,
    pub device: Arc<Device>,
    pub conn: Arc<Connection>,
    pub qp: Arc<SoftQueuePair>,
    pub events: flume::Receiver<Event>,
}

impl Harness {
    /// Accepted and established, not logged in.
    pub fn up(attrs: DeviceAttributes, dev_cfg: DeviceConfig, cfg: ConnectionConfig) -> Self {
        init_tracing();
        let verbs = SoftDevice::new("soft0", attrs);
        let device = Device::open(verbs.clone(), &dev_cfg).unwrap();
        let (recorder, events) = Recorder::new();
        let conn = Connection::accept(&device, 1, cfg, recorder).unwrap();
        let qp = verbs.queue_pair(conn.qp_num()).unwrap();
        conn.on_established().unwrap();
        assert_eq!(next_state(&events), ConnectionState::Up);
        Self {
            verbs,
            device,
            conn,
            qp,
            events,
        }
    }

    pub fn full_feature(attrs: DeviceAttributes, dev_cfg: DeviceConfig, cfg: ConnectionConfig) -> Self {
        let h = Self::up(attrs, dev_cfg, cfg);
        h.conn.login_complete().unwrap();
        assert_eq!(next_state(&h.events), ConnectionState::FullFeature);
        h
    }

    pub fn next_transfer(&self) -> (u32, TransferStatus) {
        loop {
            match self.events.recv_timeout(TIMEOUT).expect("no transfer completion") {
                Event::Transfer(tag, status) => return (tag, status),
                _ => continue,
            }
        }
    }
}

pub fn next_state(events: &flume::Receiver<Event>) -> ConnectionState {
    loop {
        match events.recv_timeout(TIMEOUT).expect("no state change") {
            Event::State(state) => return state,
            _ => continue,
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(1));
    }
}
