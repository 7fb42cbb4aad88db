use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::verbs::{CompletionQueue, CqNotifier, VerbsDevice, WorkCompletion};
use crate::error::{IserError, IserResult};

/// Receiver of completions for one queue pair.
pub trait CompletionSink: Send + Sync {
    fn handle_completion(&self, wc: &WorkCompletion);
}

#[derive(Debug)]
enum ProcessorCmd {
    /// The completion queue fired its armed notifier.
    Notify,
    Shutdown,
}

/// One completion queue plus the worker thread that drains it.
///
/// The queue's notifier only enqueues a wakeup; all completion handling runs
/// on the worker, so completions of every queue pair attached here are
/// processed strictly one at a time.
pub struct CompletionProcessor {
    index: usize,
    verbs: Arc<dyn VerbsDevice>,
    cq: Arc<dyn CompletionQueue>,
    sinks: Arc<DashMap<u32, Weak<dyn CompletionSink>>>,
    active_qps: AtomicUsize,
    processed: Arc<AtomicU64>,
    cmd_tx: Sender<ProcessorCmd>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl CompletionProcessor {
    pub fn start(
        index: usize,
        verbs: Arc<dyn VerbsDevice>,
        cq_entries: usize,
        batch: usize,
    ) -> IserResult<Self> {
        let (cmd_tx, cmd_rx) = unbounded::<ProcessorCmd>();
        let notify_tx = cmd_tx.clone();
        let notifier: CqNotifier = Arc::new(move || {
            // Best-effort; a closed channel means the worker is gone.
            let _ = notify_tx.send(ProcessorCmd::Notify);
        });
        let cq = verbs.create_cq(cq_entries, index, notifier)?;
        let sinks: Arc<DashMap<u32, Weak<dyn CompletionSink>>> = Arc::new(DashMap::new());
        let processed = Arc::new(AtomicU64::new(0));

        let spawned = {
            let cq = cq.clone();
            let sinks = sinks.clone();
            let processed = processed.clone();
            thread::Builder::new()
                .name(format!("iser-comp-{}", index))
                .spawn(move || run_worker(cq, sinks, processed, cmd_rx, batch.max(1)))
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                let _ = verbs.destroy_cq(cq.as_ref());
                return Err(IserError::Io(e));
            }
        };
        let worker_id = worker.thread().id();

        if cq.req_notify() {
            let _ = cmd_tx.send(ProcessorCmd::Notify);
        }
        debug!(index, cq = cq.id(), "completion processor started");

        Ok(Self {
            index,
            verbs,
            cq,
            sinks,
            active_qps: AtomicUsize::new(0),
            processed,
            cmd_tx,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cq(&self) -> &Arc<dyn CompletionQueue> {
        &self.cq
    }

    /// Route completions for `qp_num` to `sink`.
    pub fn attach(&self, qp_num: u32, sink: Weak<dyn CompletionSink>) {
        self.sinks.insert(qp_num, sink);
        self.active_qps.fetch_add(1, Ordering::AcqRel);
    }

    pub fn detach(&self, qp_num: u32) {
        if self.sinks.remove(&qp_num).is_some() {
            self.active_qps.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Queue pairs currently attached.
    pub fn active_qps(&self) -> usize {
        self.active_qps.load(Ordering::Acquire)
    }

    /// Completions dispatched since start.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl Drop for CompletionProcessor {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ProcessorCmd::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            // Dropped from our own worker when a completion released the last
            // owner; that thread exits on its own after the current batch.
            if thread::current().id() != self.worker_id {
                let _ = handle.join();
            }
        }
        if let Err(e) = self.verbs.destroy_cq(self.cq.as_ref()) {
            warn!(index = self.index, cq = self.cq.id(), "failed to destroy cq: {}", e);
        }
    }
}

fn run_worker(
    cq: Arc<dyn CompletionQueue>,
    sinks: Arc<DashMap<u32, Weak<dyn CompletionSink>>>,
    processed: Arc<AtomicU64>,
    cmd_rx: Receiver<ProcessorCmd>,
    batch: usize,
) {
    let mut wcs: Vec<WorkCompletion> = Vec::with_capacity(batch);
    let mut last_err_log = Instant::now();
    let mut err_logged: u64 = 0;
    let mut err_suppressed: u64 = 0;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            ProcessorCmd::Notify => {}
            ProcessorCmd::Shutdown => break,
        }
        loop {
            wcs.clear();
            let n = cq.poll(&mut wcs, batch);
            for wc in &wcs {
                if !wc.status.is_success() && !wc.status.is_flush() {
                    // Rate-limit error logging.
                    if last_err_log.elapsed() >= Duration::from_secs(1) {
                        if err_suppressed > 0 {
                            error!("work completion errors: suppressed {} in the last 1s", err_suppressed);
                        }
                        err_logged = 0;
                        err_suppressed = 0;
                        last_err_log = Instant::now();
                    }
                    if err_logged < 16 {
                        err_logged += 1;
                        error!(
                            "work completion error: status={:?} opcode={:?} wr_id={:#x} qp={}",
                            wc.status, wc.opcode, wc.wr_id, wc.qp_num
                        );
                    } else {
                        err_suppressed += 1;
                    }
                }

                let sink = sinks.get(&wc.qp_num).and_then(|s| s.upgrade());
                match sink {
                    Some(sink) => sink.handle_completion(wc),
                    None => debug!(qp = wc.qp_num, wr_id = wc.wr_id, "completion for detached qp"),
                }
            }
            processed.fetch_add(n as u64, Ordering::Relaxed);

            // A short batch means the queue looked empty; re-arm and make
            // sure nothing slipped in before the arm took effect.
            if n < batch && !cq.req_notify() {
                break;
            }
        }
    }
}
